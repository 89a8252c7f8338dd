//! Configuration from the environment, with an optional dotenv-style config
//! file loaded first (never overriding variables already set).
//!
//! Wallets are declared through `WALLET*` variables:
//! `WALLET0="[height] kind [reqsigs] xkey [xkey...]"`, e.g.
//! `WALLET0="840000 p2wpkh xpub6BosfCnifzxcF..."` or
//! `WALLET1="p2sh 2 xpub... xpub... xpub..."`.

use std::env;
use std::fs;
use std::path::PathBuf;

use faro_hd::bip32::ExtendedKey;
use faro_hd::script::Kind;
use faro_log::{Format, Level, LogConfig};
use faro_primitives::Network;
use faro_sync::WalletConfig;

const APP_DIR: &str = "faro";
const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:50002";

#[derive(Debug)]
pub enum ConfigError {
    MissingVar(&'static str),
    BadWallet { var: String, reason: String },
    NoWallets,
    NoHome,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVar(name) => write!(f, "undefined env: {name}"),
            ConfigError::BadWallet { var, reason } => {
                write!(f, "bad wallet spec in {var}: {reason}")
            }
            ConfigError::NoWallets => write!(f, "no wallets to track"),
            ConfigError::NoHome => write!(f, "cannot resolve a home directory"),
        }
    }
}

impl std::error::Error for ConfigError {}

pub struct Config {
    pub node_addr: String,
    pub network: Network,
    pub listen_addr: String,
    pub db_path: PathBuf,
    pub log: LogConfig,
    pub wallets: Vec<WalletConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config_file = match env::var("CONFIG_FILE") {
            Ok(path) => PathBuf::from(path),
            Err(_) => xdg_config_home()?.join(APP_DIR).join("faro.conf"),
        };
        load_env_file(&config_file);

        let node_addr =
            env::var("BTC_NODE_ADDR").map_err(|_| ConfigError::MissingVar("BTC_NODE_ADDR"))?;
        let network = Network::from_str_lossy(&env::var("BTC_NETWORK").unwrap_or_default());
        let listen_addr =
            env::var("LISTEN_ADDRESS").unwrap_or_else(|_| DEFAULT_LISTEN_ADDRESS.to_string());
        let db_path = match env::var("SQLITE_DB_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => xdg_data_home()?.join(APP_DIR).join("db.sqlite3"),
        };

        let mut log = LogConfig::default();
        if let Ok(level) = env::var("LOG_LEVEL") {
            if let Some(level) = Level::parse(&level) {
                log.level = level;
            }
        }
        if let Ok(format) = env::var("LOG_FORMAT") {
            if let Some(format) = Format::parse(&format) {
                log.format = format;
            }
        }

        let mut wallets = Vec::new();
        let mut vars: Vec<(String, String)> = env::vars()
            .filter(|(name, _)| name.starts_with("WALLET"))
            .collect();
        vars.sort();
        for (name, spec) in vars {
            let wallet = parse_wallet_spec(&spec).map_err(|reason| ConfigError::BadWallet {
                var: name.clone(),
                reason,
            })?;
            wallets.push(wallet);
        }
        if wallets.is_empty() {
            return Err(ConfigError::NoWallets);
        }

        Ok(Self {
            node_addr,
            network,
            listen_addr,
            db_path,
            log,
            wallets,
        })
    }
}

/// `[height] kind [reqsigs] xkey [xkey...]` with whitespace separators.
fn parse_wallet_spec(spec: &str) -> Result<WalletConfig, String> {
    let mut tokens = spec.split_whitespace().peekable();

    let birth_height = match tokens.peek() {
        Some(token) => match token.parse::<i64>() {
            Ok(height) => {
                tokens.next();
                height.max(0)
            }
            Err(_) => 0,
        },
        None => return Err("empty spec".to_string()),
    };

    let kind_token = tokens.next().ok_or("missing script kind")?;
    let kind = Kind::parse(kind_token).ok_or_else(|| format!("unknown kind: {kind_token}"))?;

    let required_sigs = match tokens.peek() {
        Some(token) => match token.parse::<u8>() {
            Ok(reqsigs) => {
                tokens.next();
                reqsigs
            }
            Err(_) => 0,
        },
        None => return Err("missing extended keys".to_string()),
    };

    let mut master_keys = Vec::new();
    for token in tokens {
        let key = ExtendedKey::decode(token).map_err(|err| format!("bad extended key: {err}"))?;
        master_keys.push(key);
    }
    if master_keys.is_empty() {
        return Err("missing extended keys".to_string());
    }
    if kind.is_multi_key() && required_sigs == 0 {
        return Err("multisig kind needs a reqsigs count".to_string());
    }

    Ok(WalletConfig {
        kind,
        required_sigs,
        master_keys,
        birth_height,
    })
}

/// Loads `KEY=VALUE` lines into the environment; existing variables win.
fn load_env_file(path: &std::path::Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };
    for line in contents.lines() {
        let Some((key, value)) = parse_env_line(line) else {
            continue;
        };
        if env::var_os(&key).is_none() {
            env::set_var(key, value);
        }
    }
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value);
    Some((key.to_string(), value.to_string()))
}

fn xdg_config_home() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(dir));
    }
    home().map(|home| home.join(".config"))
}

fn xdg_data_home() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME") {
        return Ok(PathBuf::from(dir));
    }
    home().map(|home| home.join(".local").join("share"))
}

fn home() -> Result<PathBuf, ConfigError> {
    env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or(ConfigError::NoHome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use faro_hd::bip32::ExtendedKey;

    fn test_xpub() -> String {
        ExtendedKey::master_from_seed(&[3u8; 32])
            .unwrap()
            .to_public()
            .unwrap()
            .encode()
    }

    #[test]
    fn wallet_spec_with_height() {
        let spec = format!("840000 p2wpkh {}", test_xpub());
        let wallet = parse_wallet_spec(&spec).unwrap();
        assert_eq!(wallet.birth_height, 840_000);
        assert_eq!(wallet.kind, Kind::P2wpkh);
        assert_eq!(wallet.required_sigs, 0);
        assert_eq!(wallet.master_keys.len(), 1);
    }

    #[test]
    fn wallet_spec_without_height() {
        let spec = format!("p2pkh {}", test_xpub());
        let wallet = parse_wallet_spec(&spec).unwrap();
        assert_eq!(wallet.birth_height, 0);
        assert_eq!(wallet.kind, Kind::P2pkh);
    }

    #[test]
    fn multisig_spec_takes_reqsigs_and_many_keys() {
        let spec = format!("100 p2wsh 2 {} {}", test_xpub(), test_xpub());
        let wallet = parse_wallet_spec(&spec).unwrap();
        assert_eq!(wallet.kind, Kind::P2wshMultisig);
        assert_eq!(wallet.required_sigs, 2);
        assert_eq!(wallet.master_keys.len(), 2);
    }

    #[test]
    fn wallet_spec_rejects_garbage() {
        assert!(parse_wallet_spec("").is_err());
        assert!(parse_wallet_spec("p2wpkh").is_err());
        assert!(parse_wallet_spec("p2tr xpub-nope").is_err());
        let spec = format!("p2wsh {}", test_xpub());
        assert!(parse_wallet_spec(&spec).is_err());
        assert!(parse_wallet_spec("p2wpkh not-an-xpub").is_err());
    }

    #[test]
    fn env_lines() {
        assert_eq!(
            parse_env_line("KEY=value"),
            Some(("KEY".to_string(), "value".to_string()))
        );
        assert_eq!(
            parse_env_line("  export KEY=\"quoted value\"  "),
            Some(("KEY".to_string(), "quoted value".to_string()))
        );
        assert_eq!(
            parse_env_line("KEY='single'"),
            Some(("KEY".to_string(), "single".to_string()))
        );
        assert_eq!(parse_env_line("# comment"), None);
        assert_eq!(parse_env_line(""), None);
        assert_eq!(parse_env_line("novalue"), None);
    }
}
