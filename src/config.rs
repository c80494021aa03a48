use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Remote automation webhook that the proxy forwards to
    #[arg(long, env = "CHATBOT_WEBHOOK_URL", global = true)]
    pub webhook_url: Option<String>,

    /// Port the proxy listens on
    #[arg(long, env = "PARLEY_PORT", default_value_t = DEFAULT_PORT, global = true)]
    pub port: u16,

    /// Chat endpoint the widget talks to
    #[arg(
        long,
        env = "PARLEY_FUNCTION_URL",
        default_value = "http://127.0.0.1:3000/chat",
        global = true
    )]
    pub function_url: String,

    /// Source label attached to every payload
    #[arg(long, env = "PARLEY_SOURCE", default_value = "Parley Chat", global = true)]
    pub source: String,

    /// Business name used in greetings
    #[arg(long, env = "PARLEY_BRAND", default_value = "ClinicIQ Solutions", global = true)]
    pub brand: String,

    /// Address offered when the assistant cannot answer
    #[arg(
        long,
        env = "PARLEY_CONTACT_EMAIL",
        default_value = "hello@cliniciqsolutions.com",
        global = true
    )]
    pub contact_email: String,

    /// Timeout budget for one chat turn, in seconds
    #[arg(long, env = "PARLEY_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS, global = true)]
    pub timeout_secs: u64,

    /// Session database; `memory` keeps the session in memory only
    #[arg(long, env = "PARLEY_STORE_PATH", global = true)]
    pub store_path: Option<String>,
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `None` means in-memory session storage.
    pub fn session_path(&self) -> Option<PathBuf> {
        match self.store_path.as_deref() {
            Some("memory") => None,
            Some(path) => Some(PathBuf::from(path)),
            None => {
                let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".into());
                Some(PathBuf::from(home_dir).join(".parley").join("session.db"))
            }
        }
    }

    /// Shown when neither the backend nor the built-in responder can answer.
    pub fn connectivity_message(&self) -> String {
        format!(
            "I'm having trouble connecting right now. Please try again later or contact us directly at {}",
            self.contact_email
        )
    }

    pub fn welcome_message(&self, name: &str) -> String {
        format!(
            "Welcome to {}, {}! 👋\nHow can I help you today? I can assist with service questions, consultations, or any information about our business solutions.",
            self.brand, name
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webhook_url: None,
            port: DEFAULT_PORT,
            function_url: "http://127.0.0.1:3000/chat".to_string(),
            source: "Parley Chat".to_string(),
            brand: "ClinicIQ Solutions".to_string(),
            contact_email: "hello@cliniciqsolutions.com".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            store_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        config: Config,
    }

    #[test]
    fn flags_override_defaults() {
        let harness = Harness::parse_from([
            "parley",
            "--port",
            "8080",
            "--timeout-secs",
            "5",
            "--store-path",
            "memory",
        ]);
        assert_eq!(harness.config.port, 8080);
        assert_eq!(harness.config.timeout(), Duration::from_secs(5));
        assert_eq!(harness.config.session_path(), None);
    }

    #[test]
    fn explicit_store_path_is_used() {
        let config = Config {
            store_path: Some("/tmp/parley.db".into()),
            ..Config::default()
        };
        assert_eq!(config.session_path(), Some(PathBuf::from("/tmp/parley.db")));
    }

    #[test]
    fn messages_mention_brand_and_contact() {
        let config = Config::default();
        assert!(config.welcome_message("Jo").contains("Jo"));
        assert!(config
            .connectivity_message()
            .ends_with("hello@cliniciqsolutions.com"));
    }
}
