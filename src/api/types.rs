//! Wire types for the Leonardo REST API.
//!
//! Required fields are non-optional so a schema change surfaces as a typed
//! parse error instead of a half-populated record.

use serde::Deserialize;

use crate::records::{GeneratedImage, GenerationStatus, ImageVariation, Record};

/// Response from `GET /generations/user/{user_id}`.
#[derive(Debug, Deserialize)]
pub struct GenerationsResponse {
    #[serde(default)]
    pub generations: Vec<ApiGeneration>,
}

#[derive(Debug, Deserialize)]
pub struct ApiGeneration {
    pub id: String,
    pub status: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub generated_images: Vec<ApiImage>,
}

#[derive(Debug, Deserialize)]
pub struct ApiImage {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub generated_image_variation_generics: Vec<ApiVariation>,
}

/// A derived asset. `url` is null while the variation is still processing.
#[derive(Debug, Deserialize)]
pub struct ApiVariation {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(rename = "transformType")]
    pub transform_type: String,
}

/// Response from `GET /me`.
#[derive(Debug, Deserialize)]
pub struct MeResponse {
    #[serde(default)]
    pub user_details: Vec<UserDetails>,
}

#[derive(Debug, Deserialize)]
pub struct UserDetails {
    pub user: ApiUser,
}

#[derive(Debug, Deserialize)]
pub struct ApiUser {
    pub id: String,
    pub username: String,
}

/// The account an API key belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

impl From<ApiGeneration> for Record {
    fn from(g: ApiGeneration) -> Self {
        let images = g
            .generated_images
            .into_iter()
            .map(|image| {
                let variations = image
                    .generated_image_variation_generics
                    .into_iter()
                    .filter_map(|v| match v.url {
                        Some(url) => Some(ImageVariation {
                            id: v.id,
                            url,
                            transform_type: v.transform_type,
                        }),
                        None => {
                            tracing::debug!(
                                generation = %g.id,
                                variation = %v.id,
                                "Variation has no URL yet, leaving it out"
                            );
                            None
                        }
                    })
                    .collect();
                GeneratedImage {
                    id: image.id,
                    url: image.url,
                    variations,
                }
            })
            .collect();

        Record::new_fetched(g.id, GenerationStatus::from(g.status), g.created_at, images)
    }
}

impl TryFrom<MeResponse> for Identity {
    type Error = super::ApiError;

    fn try_from(resp: MeResponse) -> Result<Self, Self::Error> {
        let user = resp
            .user_details
            .into_iter()
            .next()
            .ok_or(super::ApiError::MissingUser)?
            .user;
        Ok(Identity {
            user_id: user.id,
            username: user.username,
        })
    }
}
