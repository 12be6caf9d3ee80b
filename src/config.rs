//! Parset-style key/value configuration and the startup tables built from it

use crate::{capture::VisSourceConfig, tasks::TaskDesc};
use std::{
    collections::BTreeMap,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Missing required parameter {0}")]
    Missing(String),
    #[error("Parameter {key} = {value:?} is invalid: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("Line {line} is not a key = value pair: {text:?}")]
    Syntax { line: usize, text: String },
    #[error("Couldn't read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn invalid(key: &str, value: &str, reason: impl Display) -> Self {
        Self::Invalid {
            key: key.to_owned(),
            value: value.to_owned(),
            reason: reason.to_string(),
        }
    }
}

/// An ordered set of key/value parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parset {
    entries: BTreeMap<String, String>,
}

impl FromIterator<(String, String)> for Parset {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn strip_comment(line: &str) -> &str {
    let start = line.char_indices().find(|&(i, c)| {
        c == '#' && line[..i].chars().next_back().map_or(true, char::is_whitespace)
    });
    start.map_or(line, |(i, _)| &line[..i])
}

impl Parset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key = value` lines, later keys override earlier ones.
    /// A `#` at the start of a line or after whitespace starts a comment.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut parset = Parset::new();
        for (i, raw) in text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    parset.insert(key.trim(), value.trim());
                }
                _ => {
                    return Err(ConfigError::Syntax {
                        line: i + 1,
                        text: raw.to_owned(),
                    })
                }
            }
        }
        Ok(parset)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get_string(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .map(str::to_owned)
            .ok_or_else(|| ConfigError::Missing(key.to_owned()))
    }

    pub fn get_parsed<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let value = self
            .get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_owned()))?;
        value
            .parse()
            .map_err(|e| ConfigError::invalid(key, value, e))
    }

    pub fn get_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if self.contains(key) {
            self.get_parsed(key)
        } else {
            Ok(default)
        }
    }

    /// A `[a, b, c]` (or bare `a, b, c`) list
    pub fn get_list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        let value = self
            .get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_owned()))?;
        let inner = value
            .strip_prefix('[')
            .and_then(|v| v.strip_suffix(']'))
            .unwrap_or(value);
        Ok(inner
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect())
    }

    pub fn get_list_parsed<T>(&self, key: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get_list(key)?
            .iter()
            .map(|v| v.parse().map_err(|e| ConfigError::invalid(key, v, e)))
            .collect()
    }

    /// Every entry under `prefix`, with the prefix removed
    #[must_use]
    pub fn subset(&self, prefix: &str) -> Parset {
        self.entries
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_owned(), v.clone()))
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Antenna {
    pub name: String,
    /// ITRF position, metres
    pub location: [f64; 3],
}

/// The correlator mode this rank receives
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelatorMode {
    pub n_beam: usize,
    /// Channels handled by one rank
    pub n_channel: usize,
    /// Frequency of global channel 0, Hz
    pub start_freq: f64,
    pub chan_width: f64,
    /// Integration time, seconds
    pub interval: f64,
}

impl CorrelatorMode {
    /// Centre frequency of a global channel
    #[must_use]
    pub fn frequency(&self, global_channel: usize) -> f64 {
        self.start_freq + global_channel as f64 * self.chan_width
    }
}

/// Everything a rank needs to build its pipeline
#[derive(Debug, Clone)]
pub struct ObsConfig {
    pub rank: usize,
    pub antennas: Vec<Antenna>,
    pub correlator: CorrelatorMode,
    /// First global channel handled by this rank
    pub channel_offset: usize,
    pub vis_source: VisSourceConfig,
    pub metadata_port: u16,
    /// How long a fetch may wait before it counts as a stall
    pub timeout: Duration,
    pub tasks: Vec<TaskDesc>,
}

fn positive_secs(parset: &Parset, key: &str, default: f64) -> Result<f64, ConfigError> {
    let v: f64 = parset.get_or(key, default)?;
    if v.is_finite() && v > 0.0 {
        Ok(v)
    } else {
        Err(ConfigError::invalid(key, &v.to_string(), "must be positive"))
    }
}

impl ObsConfig {
    pub fn from_parset(parset: &Parset, rank: usize) -> Result<Self, ConfigError> {
        let antennas = parset
            .get_list("antennas")?
            .into_iter()
            .map(|name| {
                let key = format!("antenna.{name}.location");
                let loc: Vec<f64> = parset.get_list_parsed(&key)?;
                let location: [f64; 3] = loc.as_slice().try_into().map_err(|_| {
                    ConfigError::invalid(&key, &format!("{loc:?}"), "expected [x, y, z]")
                })?;
                Ok(Antenna { name, location })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        if antennas.is_empty() {
            return Err(ConfigError::invalid("antennas", "[]", "no antennas"));
        }

        let correlator = CorrelatorMode {
            n_beam: parset.get_or("correlator.nbeam", 1)?,
            n_channel: parset.get_parsed("correlator.nchan")?,
            start_freq: parset.get_parsed("correlator.start_freq")?,
            chan_width: parset.get_parsed("correlator.chan_width")?,
            interval: positive_secs(parset, "correlator.interval", 5.0)?,
        };
        if correlator.n_beam == 0 || correlator.n_channel == 0 {
            return Err(ConfigError::invalid(
                "correlator.nchan",
                &correlator.n_channel.to_string(),
                "beams and channels must be non-zero",
            ));
        }

        let port = if parset.contains("vis_source.ports") {
            let ports: Vec<u16> = parset.get_list_parsed("vis_source.ports")?;
            *ports.get(rank).ok_or_else(|| {
                ConfigError::invalid(
                    "vis_source.ports",
                    &format!("{ports:?}"),
                    format!("no port for rank {rank}"),
                )
            })?
        } else {
            parset.get_parsed("vis_source.port")?
        };
        let defaults = VisSourceConfig::default();
        let vis_source = VisSourceConfig {
            port,
            recv_buffer_size: parset
                .get_or("vis_source.receive_buffer_size", defaults.recv_buffer_size)?,
            verify_recv_buffer: parset
                .get_or("vis_source.verify_receive_buffer", defaults.verify_recv_buffer)?,
            ring_capacity: parset.get_or("vis_source.ring_capacity", defaults.ring_capacity)?,
            core: if parset.contains("vis_source.core") {
                Some(parset.get_parsed("vis_source.core")?)
            } else {
                None
            },
        };
        if vis_source.ring_capacity == 0 {
            return Err(ConfigError::invalid(
                "vis_source.ring_capacity",
                "0",
                "must be non-zero",
            ));
        }

        Ok(Self {
            rank,
            channel_offset: rank * correlator.n_channel,
            antennas,
            correlator,
            vis_source,
            metadata_port: parset.get_parsed("metadata_source.port")?,
            timeout: Duration::from_secs_f64(positive_secs(parset, "ingest.timeout", 10.0)?),
            tasks: TaskDesc::from_parset(parset)?,
        })
    }

    /// Look up an antenna by its index in the antenna table
    pub fn antenna(&self, index: u32) -> Option<&Antenna> {
        self.antennas.get(index as usize)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tasks::TaskKind;

    pub(crate) const EXAMPLE: &str = "
# Three antennas, one beam
antennas = [ak01, ak02, ak03]
antenna.ak01.location = [-2556084.669, 5097398.337, -2848424.133]
antenna.ak02.location = [-2556118.102, 5097384.726, -2848417.280]
antenna.ak03.location = [-2556167.500, 5097336.402, -2848459.450]

correlator.nbeam = 2
correlator.nchan = 32
correlator.start_freq = 1.2e9
correlator.chan_width = 1e6
correlator.interval = 5

vis_source.ports = [3000, 3001]
vis_source.ring_capacity = 1024
metadata_source.port = 4000
ingest.timeout = 2.5

tasks.tasklist = [uvw, avg, sink]
tasks.uvw.type = CalcUVWTask
tasks.avg.type = ChannelAvgTask
tasks.avg.params.averaging = 4
tasks.sink.type = NullSinkTask
";

    #[test]
    fn test_parse() {
        let parset = Parset::parse("a = 1\n# comment\n\n b.c = [x, y] # trailing\nempty =\n").unwrap();
        assert_eq!(parset.len(), 3);
        assert_eq!(parset.get("a"), Some("1"));
        assert_eq!(parset.get_list("b.c").unwrap(), vec!["x", "y"]);
        assert_eq!(parset.get("empty"), Some(""));
    }

    #[test]
    fn test_hash_inside_value() {
        let parset = Parset::parse("sink.filename = run#3.bin\nlabel = a#b # note\n#x = 1\n").unwrap();
        assert_eq!(parset.get("sink.filename"), Some("run#3.bin"));
        assert_eq!(parset.get("label"), Some("a#b"));
        assert!(!parset.contains("#x"));
        assert_eq!(parset.len(), 2);
    }

    #[test]
    fn test_parse_syntax_error() {
        let err = Parset::parse("a = 1\nnot a pair\n").unwrap_err();
        assert!(matches!(err, ConfigError::Syntax { line: 2, .. }));
    }

    #[test]
    fn test_typed_getters() {
        let parset = Parset::parse("n = 4\nbad = four\nf = [1.5, 2]").unwrap();
        assert_eq!(parset.get_parsed::<usize>("n").unwrap(), 4);
        assert!(matches!(
            parset.get_parsed::<usize>("bad"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            parset.get_parsed::<usize>("nope"),
            Err(ConfigError::Missing(_))
        ));
        assert_eq!(parset.get_or("nope", 7usize).unwrap(), 7);
        assert_eq!(parset.get_list_parsed::<f64>("f").unwrap(), vec![1.5, 2.0]);
    }

    #[test]
    fn test_subset() {
        let parset = Parset::parse("tasks.a.params.x = 1\ntasks.a.params.y = 2\ntasks.b.x = 3").unwrap();
        let sub = parset.subset("tasks.a.params.");
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.get("y"), Some("2"));
    }

    #[test]
    fn test_obs_config() {
        let parset = Parset::parse(EXAMPLE).unwrap();
        let config = ObsConfig::from_parset(&parset, 1).unwrap();
        assert_eq!(config.antennas.len(), 3);
        assert_eq!(config.antennas[1].name, "ak02");
        assert_eq!(config.vis_source.port, 3001);
        assert_eq!(config.vis_source.ring_capacity, 1024);
        assert_eq!(config.channel_offset, 32);
        assert_eq!(config.timeout, Duration::from_secs_f64(2.5));
        assert_eq!(config.tasks.len(), 3);
        assert_eq!(config.tasks[1].kind, TaskKind::ChannelAvg);
        assert!((config.correlator.frequency(2) - 1.202e9).abs() < 1e-3);
    }

    #[test]
    fn test_obs_config_missing_port_for_rank() {
        let parset = Parset::parse(EXAMPLE).unwrap();
        assert!(matches!(
            ObsConfig::from_parset(&parset, 2),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
