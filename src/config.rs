//! Configuration types.
//!
//! Everything is read once in `main` and handed to each component at
//! construction time.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default OpenAI-compatible endpoint used for correction hints.
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.deepseek.com/v1";

/// Default model for correction hints.
pub const DEFAULT_LLM_MODEL: &str = "deepseek-chat";

/// Pricing for the single service the bot sells.
#[derive(Debug, Clone)]
pub struct PricingConfig {
    /// Displayed fiat price in major units (e.g. 399 roubles).
    pub fiat_price: i64,
    /// Price in points; points have no sub-unit.
    pub points_price: i64,
    /// Currency code sent to the processor for fiat invoices.
    pub fiat_currency: String,
    /// Currency code sent to the processor for points invoices.
    pub points_currency: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            fiat_price: 399,
            points_price: 200,
            fiat_currency: "RUB".to_string(),
            points_currency: "XTR".to_string(),
        }
    }
}

/// Correction advisor (language model) settings.
#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    /// API key; `None` disables the model and always uses fallback hints.
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    /// Hard upper bound on a single advisor call.
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            model: DEFAULT_LLM_MODEL.to_string(),
            timeout: Duration::from_secs(20),
            temperature: 0.7,
            max_tokens: 500,
        }
    }
}

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Telegram bot token.
    pub bot_token: SecretString,
    /// Processor token attached to invoices (empty for points).
    pub payment_provider_token: SecretString,
    /// Chat receiving submission summaries and payment alerts.
    pub ops_chat_id: i64,
    pub pricing: PricingConfig,
    pub advisor: AdvisorConfig,
    pub db_path: PathBuf,
    /// Port for the ops HTTP surface; 0 disables it.
    pub http_port: u16,
    /// Attempts for the record write at form completion.
    pub persist_attempts: u32,
    /// How long an authorized payment may wait for its completion callback.
    pub authorization_ttl: Duration,
    /// Directory for rotated log files; `None` logs to stderr only.
    pub log_dir: Option<PathBuf>,
}

impl BotConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bot_token = get("BOT_TOKEN")
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("BOT_TOKEN".into()))?;

        let ops_chat_id = match get("OPS_CHAT_ID") {
            Some(raw) => parse_value::<i64>("OPS_CHAT_ID", &raw)?,
            None => return Err(ConfigError::MissingEnvVar("OPS_CHAT_ID".into())),
        };

        let payment_provider_token =
            SecretString::from(get("PAYMENT_PROVIDER_TOKEN").unwrap_or_default());

        let defaults = PricingConfig::default();
        let pricing = PricingConfig {
            fiat_price: parse_or("PRICE_FIAT", get("PRICE_FIAT"), defaults.fiat_price)?,
            points_price: parse_or("PRICE_POINTS", get("PRICE_POINTS"), defaults.points_price)?,
            fiat_currency: get("FIAT_CURRENCY").unwrap_or(defaults.fiat_currency),
            points_currency: get("POINTS_CURRENCY").unwrap_or(defaults.points_currency),
        };
        for (key, value) in [
            ("PRICE_FIAT", pricing.fiat_price),
            ("PRICE_POINTS", pricing.points_price),
        ] {
            if value <= 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    message: format!("price must be positive, got {value}"),
                });
            }
        }

        let advisor_defaults = AdvisorConfig::default();
        let advisor = AdvisorConfig {
            api_key: get("LLM_API_KEY").map(SecretString::from),
            base_url: get("LLM_BASE_URL").unwrap_or(advisor_defaults.base_url),
            model: get("LLM_MODEL").unwrap_or(advisor_defaults.model),
            timeout: Duration::from_secs(parse_or(
                "ADVISOR_TIMEOUT_SECS",
                get("ADVISOR_TIMEOUT_SECS"),
                advisor_defaults.timeout.as_secs(),
            )?),
            ..advisor_defaults
        };

        let persist_attempts: u32 = parse_or("PERSIST_ATTEMPTS", get("PERSIST_ATTEMPTS"), 3)?;
        if persist_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PERSIST_ATTEMPTS".into(),
                message: "must be at least 1".into(),
            });
        }

        let ttl_mins: u64 = parse_or(
            "AUTHORIZATION_TTL_MINS",
            get("AUTHORIZATION_TTL_MINS"),
            30,
        )?;

        Ok(Self {
            bot_token,
            payment_provider_token,
            ops_chat_id,
            pricing,
            advisor,
            db_path: get("BOT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/intake.db")),
            http_port: parse_or("BOT_HTTP_PORT", get("BOT_HTTP_PORT"), 8080)?,
            persist_attempts,
            authorization_ttl: Duration::from_secs(ttl_mins * 60),
            log_dir: get("BOT_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        })
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}
