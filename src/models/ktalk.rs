use serde::Deserialize;

// ==================================================================================================
// Recording list
// ==================================================================================================

/// One entry of `GET /api/Domain/recordings/v2`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    #[serde(default, alias = "recordingKey")]
    pub key: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_date: Option<String>,
    /// Seconds
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub participants_count: Option<u64>,
}

// ==================================================================================================
// Recording metadata
// ==================================================================================================

/// `GET /api/Recordings/{key}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_date: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub participants_count: Option<u64>,
    #[serde(default)]
    pub created_by: Option<Person>,
    #[serde(default)]
    pub participants: Option<Vec<Participant>>,
    #[serde(default)]
    pub qualities: Option<Vec<Quality>>,
    #[serde(default)]
    pub transcription: Option<TranscriptionStatus>,
    #[serde(default)]
    pub has_audio_record: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(default)]
    pub firstname: Option<String>,
    #[serde(default)]
    pub surname: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Person {
    /// "Firstname Surname", trimmed; empty when both are missing
    pub fn full_name(&self) -> String {
        format!(
            "{} {}",
            self.firstname.as_deref().unwrap_or_default(),
            self.surname.as_deref().unwrap_or_default()
        )
        .trim()
        .to_string()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(default)]
    pub anonymous_name: Option<String>,
    #[serde(default)]
    pub user_info: Option<Person>,
}

impl Participant {
    pub fn display_name(&self) -> String {
        if let Some(name) = self.anonymous_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        let name = self
            .user_info
            .as_ref()
            .map(Person::full_name)
            .unwrap_or_default();
        if name.is_empty() {
            "Unknown".to_string()
        } else {
            name
        }
    }
}

/// Downloadable rendition of a recording
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Quality {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub size: Option<QualitySize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QualitySize {
    #[serde(default)]
    pub width: Option<u64>,
    #[serde(default)]
    pub height: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptionStatus {
    #[serde(default)]
    pub status: Option<String>,
}
