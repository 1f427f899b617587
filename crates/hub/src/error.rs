use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PlantError {
    /// A sensor reported a value that is present but not a number.
    #[error("malformed reading from sensor '{sensor}': '{value}'")]
    MalformedReading { sensor: String, value: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("sensor '{0}' does not exist")]
    UnknownSensor(String),

    #[error("unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("plant '{0}' is already complete")]
    AlreadyComplete(String),

    #[error("plant '{0}' is not fully configured yet")]
    NotReady(String),

    #[error("invalid sensor source: {0}")]
    InvalidSource(String),

    #[error("invalid threshold: {0}")]
    InvalidThreshold(String),
}

impl PlantError {
    pub(crate) fn plant_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "plant",
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PlantError>;
