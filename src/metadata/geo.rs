use crate::config::Config;
use crate::errors::{AppError, AppResult};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const EARTH_RADIUS_KM: f64 = 6371.0;
const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// A named place. Field names accept both the dataset's lower-case keys and
/// the capitalized keys geocoding services usually return.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Place {
    #[serde(default, alias = "City")]
    pub city: String,
    #[serde(default, alias = "Province")]
    pub province: String,
    #[serde(default, alias = "Country")]
    pub country: String,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
}

/// Reverse geocoding: coordinates to a place name.
pub enum Geocoder {
    Disabled,
    Offline(Vec<Place>),
    Remote { client: reqwest::Client, base: String },
}

impl Geocoder {
    /// A configured service wins over a local dataset.
    pub fn from_config(config: &Config) -> AppResult<Self> {
        if let Some(base) = &config.location_service {
            let client = reqwest::Client::builder()
                .timeout(REMOTE_TIMEOUT)
                .build()
                .map_err(|e| AppError::Config(format!("location service client: {}", e)))?;
            log::info!("Reverse geocoding via {}", base);
            return Ok(Geocoder::Remote {
                client,
                base: base.clone(),
            });
        }
        if let Some(path) = &config.location_dataset {
            let places = load_dataset(path)?;
            log::info!("Loaded {} places from {:?}", places.len(), path);
            return Ok(Geocoder::Offline(places));
        }
        Ok(Geocoder::Disabled)
    }

    /// `None` when geocoding is off or nothing matched.
    pub async fn resolve(&self, latitude: f64, longitude: f64) -> AppResult<Option<Place>> {
        match self {
            Geocoder::Disabled => Ok(None),
            Geocoder::Offline(places) => Ok(nearest(places, latitude, longitude).cloned()),
            Geocoder::Remote { client, base } => {
                let url = format!("{}/?lon={}&lat={}", base, longitude, latitude);
                let response = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| AppError::Extraction(format!("location request failed: {}", e)))?;
                if !response.status().is_success() {
                    return Err(AppError::Extraction(format!(
                        "location service returned {}",
                        response.status()
                    )));
                }
                let place: Place = response
                    .json()
                    .await
                    .map_err(|e| AppError::Extraction(format!("location response: {}", e)))?;
                Ok(Some(place))
            }
        }
    }
}

/// JSON array of places with coordinates.
pub fn load_dataset(path: &Path) -> AppResult<Vec<Place>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("location dataset {:?}: {}", path, e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| AppError::Config(format!("location dataset {:?}: {}", path, e)))
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (p1, p2) = (lat1.to_radians(), lat2.to_radians());
    let dp = (lat2 - lat1).to_radians();
    let dl = (lon2 - lon1).to_radians();
    let a = (dp / 2.0).sin().powi(2) + p1.cos() * p2.cos() * (dl / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

pub fn nearest(places: &[Place], latitude: f64, longitude: f64) -> Option<&Place> {
    places.iter().min_by(|a, b| {
        let da = haversine_km(latitude, longitude, a.latitude, a.longitude);
        let db = haversine_km(latitude, longitude, b.latitude, b.longitude);
        da.total_cmp(&db)
    })
}

/// `"<city>, <province> <country>"`, leaving out empty parts.
pub fn compose_location(place: &Place) -> String {
    let tail = [place.province.trim(), place.country.trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    [place.city.trim(), tail.as_str()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}
