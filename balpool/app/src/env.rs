use crate::Config;
use balpool_balance::Settings;
use balpool_exp_backoff::ExponentialBackoff;
use balpool_pool::{PoolConfig, PortMap};
use std::{str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{error, warn};

/// The strings used to build a configuration.
pub trait Strings {
    /// Retrieves the value for the key `key`.
    ///
    /// `key` must be one of the `ENV_` values below.
    fn get(&self, key: &str) -> Result<Option<String>, EnvError>;
}

/// An implementation of `Strings` that reads the values from environment variables.
pub struct Env;

/// Errors produced when loading a `Config` struct.
#[derive(Clone, Debug, Error)]
pub enum EnvError {
    #[error("invalid environment variable")]
    InvalidEnvVar,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum ParseError {
    #[error("not a valid duration")]
    NotADuration,
    #[error("not a number")]
    NotANumber,
    #[error("not a valid network: {0:?}")]
    NotANetwork(String),
    #[error("not a valid port map: {0}")]
    NotAPortMap(
        #[from]
        #[source]
        balpool_pool::InvalidPortMap,
    ),
}

pub const ENV_CONNECT_TIMEOUT: &str = "BALPOOL_CONNECT_TIMEOUT";
pub const ENV_INITIAL_WAIT: &str = "BALPOOL_INITIAL_WAIT";
pub const ENV_NET_NETWORK: &str = "BALPOOL_NET_NETWORK";
pub const ENV_UNIX_NETWORK: &str = "BALPOOL_UNIX_NETWORK";

/// Extra `num=key[,key...]` entries layered over the default port map.
pub const ENV_PORT_MAP: &str = "BALPOOL_PORT_MAP";

pub const ENV_DISCOVERY_BACKOFF_MIN: &str = "BALPOOL_DISCOVERY_BACKOFF_MIN";
pub const ENV_DISCOVERY_BACKOFF_MAX: &str = "BALPOOL_DISCOVERY_BACKOFF_MAX";
pub const ENV_DISCOVERY_BACKOFF_JITTER: &str = "BALPOOL_DISCOVERY_BACKOFF_JITTER";

pub const ENV_DEFAULT_RETRIES: &str = "BALPOOL_DEFAULT_RETRIES";
pub const ENV_DEFAULT_FAIL_COST: &str = "BALPOOL_DEFAULT_FAIL_COST";
pub const ENV_DEFAULT_SOFT_FAIL_COST: &str = "BALPOOL_DEFAULT_SOFT_FAIL_COST";

const NET_NETWORKS: &[&str] = &["tcp", "tcp4", "tcp6"];
const UNIX_NETWORKS: &[&str] = &["unix"];

// === impl Env ===

impl Strings for Env {
    fn get(&self, key: &str) -> Result<Option<String>, EnvError> {
        use std::env;

        match env::var(key) {
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) => Ok(None),
            Err(env::VarError::NotUnicode(_)) => {
                error!("{key} is not encoded in Unicode");
                Err(EnvError::InvalidEnvVar)
            }
        }
    }
}

impl Env {
    pub fn try_config(&self) -> Result<Config, EnvError> {
        parse_config(self)
    }
}

// === Parsing ===

/// Load a `Config` by reading ENV variables.
pub fn parse_config<S: Strings>(strings: &S) -> Result<Config, EnvError> {
    let defaults = PoolConfig::default();

    // Parse all the environment variables. `parse` will log any errors so
    // defer returning any errors until all of them have been parsed.
    let connect_timeout = parse(strings, ENV_CONNECT_TIMEOUT, parse_duration);
    let initial_wait = parse(strings, ENV_INITIAL_WAIT, parse_duration);
    let net_network = parse(strings, ENV_NET_NETWORK, |s| parse_network(s, NET_NETWORKS));
    let unix_network = parse(strings, ENV_UNIX_NETWORK, |s| parse_network(s, UNIX_NETWORKS));
    let port_map = parse(strings, ENV_PORT_MAP, parse_port_map);
    let discovery_backoff = parse_backoff(strings, defaults.discovery_backoff);
    let balance = parse_balance(strings, defaults.balance);

    let connect_timeout = connect_timeout?.unwrap_or(defaults.connect_timeout);
    if connect_timeout.is_zero() {
        error!("{ENV_CONNECT_TIMEOUT} must be greater than zero");
        return Err(EnvError::InvalidEnvVar);
    }

    Ok(Config {
        pool: PoolConfig {
            connect_timeout,
            initial_wait: initial_wait?.unwrap_or(defaults.initial_wait),
            net_network: net_network?.unwrap_or(defaults.net_network),
            unix_network: unix_network?.unwrap_or(defaults.unix_network),
            port_map: match port_map? {
                Some(extra) => defaults.port_map.merged(&extra),
                None => defaults.port_map,
            },
            discovery_backoff: discovery_backoff?,
            balance: balance?,
        },
    })
}

pub(crate) fn parse<T, Parse>(
    strings: &dyn Strings,
    name: &str,
    parse: Parse,
) -> Result<Option<T>, EnvError>
where
    Parse: FnOnce(&str) -> Result<T, ParseError>,
{
    match strings.get(name)? {
        Some(ref s) => {
            let r = parse(s).map_err(|parse_error| {
                error!("{name}={s:?} is not valid: {parse_error:?}");
                EnvError::InvalidEnvVar
            })?;
            Ok(Some(r))
        }
        None => Ok(None),
    }
}

pub fn parse_backoff<S: Strings>(
    strings: &S,
    default: ExponentialBackoff,
) -> Result<ExponentialBackoff, EnvError> {
    let min = parse(strings, ENV_DISCOVERY_BACKOFF_MIN, parse_duration);
    let max = parse(strings, ENV_DISCOVERY_BACKOFF_MAX, parse_duration);
    let jitter = parse(strings, ENV_DISCOVERY_BACKOFF_JITTER, parse_number::<f64>);

    match (min?, max?, jitter?) {
        (None, None, None) => Ok(default),
        (Some(min), Some(max), jitter) => {
            ExponentialBackoff::try_new(min, max, jitter.unwrap_or_default()).map_err(|error| {
                error!(message="Invalid backoff", %error, ?min, ?max, ?jitter);
                EnvError::InvalidEnvVar
            })
        }
        _ => {
            error!("You need to specify either all of {ENV_DISCOVERY_BACKOFF_MIN} {ENV_DISCOVERY_BACKOFF_MAX} or none of them to use the default backoff");
            Err(EnvError::InvalidEnvVar)
        }
    }
}

fn parse_balance<S: Strings>(strings: &S, default: Settings) -> Result<Settings, EnvError> {
    let retries = parse(strings, ENV_DEFAULT_RETRIES, parse_number::<u32>);
    let fail_cost = parse(strings, ENV_DEFAULT_FAIL_COST, parse_cost);
    let soft_fail_cost = parse(strings, ENV_DEFAULT_SOFT_FAIL_COST, parse_cost);

    let settings = Settings {
        retries: retries?.unwrap_or(default.retries),
        fail_cost: fail_cost?.unwrap_or(default.fail_cost),
        soft_fail_cost: soft_fail_cost?.unwrap_or(default.soft_fail_cost),
        ..default
    };
    if settings.soft_fail_cost > settings.fail_cost {
        warn!(
            soft_fail_cost = settings.soft_fail_cost,
            fail_cost = settings.fail_cost,
            "Soft failures are penalized more than failures"
        );
    }
    Ok(settings)
}

fn parse_number<T>(s: &str) -> Result<T, ParseError>
where
    T: FromStr,
{
    s.parse().map_err(|_| ParseError::NotANumber)
}

fn parse_cost(s: &str) -> Result<u64, ParseError> {
    match parse_number(s)? {
        0 => Err(ParseError::NotANumber),
        cost => Ok(cost),
    }
}

fn parse_duration(s: &str) -> Result<Duration, ParseError> {
    use regex::Regex;

    let re = Regex::new(r"^\s*(\d+)(ms|s|m|h|d)?\s*$").expect("duration regex");

    let cap = re.captures(s).ok_or(ParseError::NotADuration)?;

    let magnitude: u64 = parse_number(&cap[1])?;
    let secs = |unit: u64| {
        magnitude
            .checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or(ParseError::NotADuration)
    };
    match cap.get(2).map(|m| m.as_str()) {
        None if magnitude == 0 => Ok(Duration::from_secs(0)),
        Some("ms") => Ok(Duration::from_millis(magnitude)),
        Some("s") => secs(1),
        Some("m") => secs(60),
        Some("h") => secs(60 * 60),
        Some("d") => secs(60 * 60 * 24),
        _ => Err(ParseError::NotADuration),
    }
}

fn parse_network(s: &str, allowed: &[&str]) -> Result<String, ParseError> {
    let s = s.trim();
    if allowed.contains(&s) {
        Ok(s.to_string())
    } else {
        Err(ParseError::NotANetwork(s.to_string()))
    }
}

fn parse_port_map(s: &str) -> Result<PortMap, ParseError> {
    Ok(s.parse()?)
}

#[cfg(test)]
impl Strings for std::collections::HashMap<&'static str, &'static str> {
    fn get(&self, key: &str) -> Result<Option<String>, EnvError> {
        Ok(self.get(key).map(ToString::to_string))
    }
}
