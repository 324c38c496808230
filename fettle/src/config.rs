use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use url::Url;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8099")]
    pub port: u16,

    #[envconfig(default = "http://127.0.0.1:8500")]
    pub registry_address: Url,

    #[envconfig(default = "5000")]
    pub registry_timeout_ms: TimeoutMs,

    pub service_name: NonEmptyString,

    // Public address of the workload. Its host and port are what gets registered.
    pub service_address: Url,

    // Where the registry should reach the health endpoint, if not at the service address.
    pub health_check_address: Option<Url>,

    #[envconfig(default = "")]
    pub service_tags: Tags,

    #[envconfig(default = "30")]
    pub heartbeat_interval_secs: NonZeroSecs,

    #[envconfig(default = "10s")]
    pub check_interval: RegistryDuration,

    #[envconfig(default = "1m")]
    pub deregister_after: RegistryDuration,

    #[envconfig(default = "")]
    pub supervise: SupervisedCommands,

    #[envconfig(default = "true")]
    pub exit_on_success: bool,

    #[envconfig(default = "5")]
    pub shutdown_grace_secs: u64,

    #[envconfig(default = "false")]
    pub export_prometheus: bool,

    #[envconfig(default = "false")]
    pub debug: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base address the health-check URL is built from.
    pub fn health_check_base(&self) -> &Url {
        self.health_check_address
            .as_ref()
            .unwrap_or(&self.service_address)
    }

    pub fn heartbeat_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.heartbeat_interval_secs.0)
    }

    pub fn registry_timeout(&self) -> time::Duration {
        self.registry_timeout_ms.0
    }

    pub fn shutdown_grace(&self) -> time::Duration {
        time::Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// A timeout given in whole milliseconds. Zero is rejected, it would fail every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutMs(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseTimeoutMsError(pub String);

impl FromStr for TimeoutMs {
    type Err = ParseTimeoutMsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(ParseTimeoutMsError(s.to_owned())),
            Ok(ms) => Ok(TimeoutMs(time::Duration::from_millis(ms))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NonZeroSecs(pub u64);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseNonZeroSecsError;

impl FromStr for NonZeroSecs {
    type Err = ParseNonZeroSecsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<u64>() {
            Ok(0) | Err(_) => Err(ParseNonZeroSecsError),
            Ok(secs) => Ok(NonZeroSecs(secs)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// A duration in the registry's own syntax (`10s`, `1m30s`, `1.5h`), forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryDuration(String);

impl RegistryDuration {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseRegistryDurationError(pub String);

impl FromStr for RegistryDuration {
    type Err = ParseRegistryDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseRegistryDurationError(s.to_owned());

        let mut rest = s.trim();
        if rest.is_empty() {
            return Err(invalid());
        }

        while !rest.is_empty() {
            let number_len = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .ok_or_else(invalid)?;
            let (number, tail) = rest.split_at(number_len);
            if number.is_empty() || number.parse::<f64>().is_err() {
                return Err(invalid());
            }

            let unit_len = tail
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(tail.len());
            let (unit, tail) = tail.split_at(unit_len);
            if !matches!(unit, "ns" | "us" | "ms" | "s" | "m" | "h") {
                return Err(invalid());
            }

            rest = tail;
        }

        Ok(RegistryDuration(s.trim().to_owned()))
    }
}

/// Comma-separated registration tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags(pub Vec<String>);

impl FromStr for Tags {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Tags(
            s.split(',')
                .map(str::trim)
                .filter(|tag| !tag.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}

/// One process the sidecar launches and watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    pub command: String,
}

/// `name=command line` entries separated by `;`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisedCommands(pub Vec<CommandSpec>);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSupervisedCommandsError(pub String);

impl FromStr for SupervisedCommands {
    type Err = ParseSupervisedCommandsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut commands = Vec::new();

        for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, command) = entry
                .split_once('=')
                .ok_or_else(|| ParseSupervisedCommandsError(entry.to_owned()))?;

            let name = name.trim();
            if name.is_empty() {
                return Err(ParseSupervisedCommandsError(entry.to_owned()));
            }

            commands.push(CommandSpec {
                name: name.to_owned(),
                command: command.trim().to_owned(),
            });
        }

        Ok(SupervisedCommands(commands))
    }
}
