use std::path::{Path, PathBuf};

use estate_chat::{DEFAULT_MODEL_ID, DEFAULT_TEMPERATURE, ModelGateway};
use estate_llm::{GEMINI_PROVIDER_ID, ProviderConfig, ProviderKind};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Deserializer, Serialize};
use snafu::{ResultExt, Snafu, ensure};

pub const SETTINGS_DIRECTORY_NAME: &str = "estate";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "ESTATE_";
/// Bare credential variable honoured alongside `ESTATE_API_KEY`.
pub const CREDENTIAL_ENV: &str = "API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantSettings {
    #[serde(default = "default_provider_id", deserialize_with = "scalar_string")]
    pub provider_id: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub api_key: String,
    #[serde(default, deserialize_with = "scalar_string")]
    pub endpoint: String,
    #[serde(default = "default_model", deserialize_with = "scalar_string")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            endpoint: String::new(),
            model: default_model(),
            temperature: default_temperature(),
        }
    }
}

impl AssistantSettings {
    pub fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider_id.trim().to_string()
        };
        self.api_key = self.api_key.trim().to_string();
        self.endpoint = self.endpoint.trim().to_string();
        self.model = if self.model.trim().is_empty() {
            default_model()
        } else {
            self.model.trim().to_string()
        };
        self
    }

    pub fn has_credential(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.endpoint)
    }

    pub fn build_gateway(&self) -> ModelGateway {
        ModelGateway::from_config(self.to_provider_config())
            .with_model(self.model.clone())
            .with_temperature(self.temperature)
    }
}

/// Layers defaults, the JSON settings file and the environment.
pub struct SettingsLoader {
    config_path: PathBuf,
}

impl SettingsLoader {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".estate"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn at_default_path() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn figment(&self) -> Figment {
        Figment::from(Serialized::defaults(AssistantSettings::default()))
            .merge(Json::file(&self.config_path))
            .merge(Env::raw().only(&[CREDENTIAL_ENV]).map(|_| "api_key".into()))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    pub fn load(&self) -> Result<AssistantSettings, SettingsError> {
        if !self.config_path.exists() {
            tracing::info!(
                "settings file not found at {:?}, using defaults and environment",
                self.config_path
            );
        }

        let settings = self
            .figment()
            .extract::<AssistantSettings>()
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: self.config_path.clone(),
            })?
            .normalized();

        ensure!(
            ProviderKind::from_id(&settings.provider_id).is_some(),
            UnsupportedProviderSnafu {
                stage: "validate-settings",
                provider_id: settings.provider_id.clone(),
            }
        );

        ensure!(
            (0.0..=2.0).contains(&settings.temperature),
            InvalidTemperatureSnafu {
                stage: "validate-settings",
                value: settings.temperature,
            }
        );

        if !settings.has_credential() {
            tracing::warn!(
                provider_id = %settings.provider_id,
                "no API credential configured; replies will report the missing key"
            );
        }

        Ok(settings)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to load settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
    #[snafu(display("provider '{provider_id}' is not supported on `{stage}`"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("temperature {value} is outside 0.0..=2.0 on `{stage}`"))]
    InvalidTemperature { stage: &'static str, value: f64 },
}

/// Environment values are parsed, so a key such as `1234567890` arrives as a
/// number.
fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Unsigned(u64),
        Signed(i64),
        Float(f64),
        Flag(bool),
    }

    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(text) => text,
        Scalar::Unsigned(value) => value.to_string(),
        Scalar::Signed(value) => value.to_string(),
        Scalar::Float(value) => value.to_string(),
        Scalar::Flag(value) => value.to_string(),
    })
}

fn default_provider_id() -> String {
    GEMINI_PROVIDER_ID.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL_ID.to_string()
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}
