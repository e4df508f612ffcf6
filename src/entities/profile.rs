use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiderProfile {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub profile_initial: Option<String>,
    #[serde(default)]
    pub total_rides: i64,
    #[serde(default)]
    pub rating: Option<f64>,
}

impl RiderProfile {
    /// Stand-in used when the rider's profile cannot be fetched.
    pub fn placeholder(user_id: &str) -> Self {
        Self {
            user_id: user_id.into(),
            name: "User".into(),
            phone_number: String::new(),
            profile_initial: Some("U".into()),
            total_rides: 0,
            rating: None,
        }
    }

    pub fn initial(&self) -> String {
        match &self.profile_initial {
            Some(initial) if !initial.is_empty() => initial.clone(),
            _ => self
                .name
                .chars()
                .next()
                .map(|c| c.to_uppercase().to_string())
                .unwrap_or_else(|| "U".into()),
        }
    }
}
