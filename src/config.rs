//! Cache configuration
//!
//! All behavior switches live in one immutable [`Config`] value. It is built
//! once, either programmatically or from the comma separated option string
//! (`save,file=app.csa,log=restore=trace`), and handed by reference to every
//! component that needs it.

use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

const M: usize = 1024 * 1024;
const G: usize = 1024 * M;

/// Default upper bound on the size of a written cache file
pub const DEFAULT_MAX_FILE_SIZE: usize = G;

/// Default number of versions kept per method during merge
pub const DEFAULT_MAX_VERSIONS: u32 = 16;

/// Hard limit on versions per method (one bit each in the unusable mask)
pub const MAX_VERSIONS_LIMIT: u32 = 32;

/// Log categories, one tracing target each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogKind {
    Archive,
    Global,
    Assembly,
    Opt,
    Save,
    Restore,
    Merge,
}

impl LogKind {
    pub const ALL: [LogKind; 7] = [
        LogKind::Archive,
        LogKind::Global,
        LogKind::Assembly,
        LogKind::Opt,
        LogKind::Save,
        LogKind::Restore,
        LogKind::Merge,
    ];

    /// Option spelling of the kind
    pub fn name(self) -> &'static str {
        match self {
            LogKind::Archive => "archive",
            LogKind::Global => "global",
            LogKind::Assembly => "assembly",
            LogKind::Opt => "opt",
            LogKind::Save => "save",
            LogKind::Restore => "restore",
            LogKind::Merge => "merge",
        }
    }

    /// Tracing target used by the library for this kind
    pub fn target(self) -> &'static str {
        match self {
            LogKind::Archive => crate::logging::ARCHIVE,
            LogKind::Global => crate::logging::GLOBAL,
            LogKind::Assembly => crate::logging::ASSEMBLY,
            LogKind::Opt => crate::logging::OPT,
            LogKind::Save => crate::logging::SAVE,
            LogKind::Restore => crate::logging::RESTORE,
            LogKind::Merge => crate::logging::MERGE,
        }
    }

    fn parse(s: &str) -> Option<Vec<LogKind>> {
        if s == "all" {
            return Some(LogKind::ALL.to_vec());
        }
        LogKind::ALL.iter().copied().find(|k| k.name() == s).map(|k| vec![k])
    }
}

/// Verbosity of one log kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    None,
    Fail,
    Warning,
    Trace,
    Info,
}

impl LogLevel {
    fn parse(s: &str) -> Option<LogLevel> {
        match s {
            "none" => Some(LogLevel::None),
            "fail" => Some(LogLevel::Fail),
            "warning" => Some(LogLevel::Warning),
            "trace" => Some(LogLevel::Trace),
            "info" => Some(LogLevel::Info),
            _ => None,
        }
    }

    /// Matching `EnvFilter` level name
    pub fn filter_level(self) -> &'static str {
        match self {
            LogLevel::None => "off",
            LogLevel::Fail => "error",
            LogLevel::Warning => "warn",
            LogLevel::Trace => "debug",
            LogLevel::Info => "trace",
        }
    }
}

/// How a version is chosen among the usable ones at revive time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevivePolicyKind {
    /// First version that passes all checks
    First,
    /// Uniformly random among all versions that pass
    Random,
    /// A specific version, else the first usable one after it
    Appointed(u32),
}

impl fmt::Display for RevivePolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevivePolicyKind::First => write!(f, "first"),
            RevivePolicyKind::Random => write!(f, "random"),
            RevivePolicyKind::Appointed(n) => write!(f, "appoint={}", n),
        }
    }
}

/// How versions of one method are reduced during merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergePolicyKind {
    /// Keep the most frequent versions
    Simple,
    /// Fold covered versions into their cover, then keep the most frequent
    Coverage,
}

impl fmt::Display for MergePolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicyKind::Simple => write!(f, "simple"),
            MergePolicyKind::Coverage => write!(f, "coverage"),
        }
    }
}

/// Heuristic instruction costs used when scoring opt records.
///
/// The defaults are empirically tuned; change them together, never one
/// in isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptCosts {
    pub virtual_call: i64,
    pub not_inline: i64,
    pub receiver_check: i64,
    pub cutted_if: i64,
    pub test_jmp: i64,
}

impl Default for OptCosts {
    fn default() -> Self {
        Self {
            virtual_call: 10,
            not_inline: 10,
            receiver_check: 10,
            cutted_if: 10,
            test_jmp: 1,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Write compiled methods to `file` at shutdown
    pub save: bool,
    /// Load `file` at startup and revive methods from it
    pub restore: bool,
    /// Run the offline merge of `input_files`/`input_list_file` into `file`
    pub merge: bool,
    /// Dump opt records of every version in `file`
    pub print_opt: bool,
    /// Abort on the first emit or revive failure
    pub fatal_on_fail: bool,
    /// Collect timers and size counters
    pub perf: bool,
    /// Check the build identity of loaded files
    pub validate_check: bool,
    /// Refuse versions that carry constant-field replacement records
    pub disable_constant_opt: bool,
    /// Re-check identities of resolved metadata before install
    pub verify_redefined_identity: bool,
    /// Fail every revive at install time (testing aid)
    pub make_revive_fail_at_nmethod: bool,
    /// Cache file to save, restore, or write the merge result to
    pub file: Option<PathBuf>,
    /// Redirect log output to this file
    pub log_file: Option<PathBuf>,
    /// Merge input: a cache file or a directory searched for `*.csa`
    pub input_files: Option<PathBuf>,
    /// Merge input: a file listing one input path per line
    pub input_list_file: Option<PathBuf>,
    /// Per-kind log levels
    pub log_levels: Vec<(LogKind, LogLevel)>,
    pub revive_policy: RevivePolicyKind,
    pub merge_policy: MergePolicyKind,
    /// Probability in percent that save/restore is enabled for a process
    pub percent: u32,
    /// Percentage of valid input files the kept merge groups must cover
    pub coverage: u32,
    /// Maximum number of containers in a merged file
    pub max_container_count: u32,
    /// Maximum number of versions kept per method in a merged file
    pub max_versions: u32,
    /// Maximum size of a written cache file in bytes
    pub max_file_size: usize,
    pub opt_costs: OptCosts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            save: false,
            restore: false,
            merge: false,
            print_opt: false,
            fatal_on_fail: false,
            perf: false,
            validate_check: true,
            disable_constant_opt: false,
            verify_redefined_identity: false,
            make_revive_fail_at_nmethod: false,
            file: None,
            log_file: None,
            input_files: None,
            input_list_file: None,
            log_levels: Vec::new(),
            revive_policy: RevivePolicyKind::First,
            merge_policy: MergePolicyKind::Simple,
            percent: 100,
            coverage: 100,
            max_container_count: i32::MAX as u32,
            max_versions: DEFAULT_MAX_VERSIONS,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            opt_costs: OptCosts::default(),
        }
    }
}

impl Config {
    /// Create a configuration with all features off
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for writing `file` at shutdown
    pub fn for_save(file: impl Into<PathBuf>) -> Self {
        Self {
            save: true,
            file: Some(file.into()),
            ..Self::default()
        }
    }

    /// Configuration for reviving from `file`
    pub fn for_restore(file: impl Into<PathBuf>) -> Self {
        Self {
            restore: true,
            file: Some(file.into()),
            ..Self::default()
        }
    }

    /// Configuration for merging into `output`
    pub fn for_merge(output: impl Into<PathBuf>) -> Self {
        Self {
            merge: true,
            file: Some(output.into()),
            ..Self::default()
        }
    }

    pub fn with_revive_policy(mut self, policy: RevivePolicyKind) -> Self {
        self.revive_policy = policy;
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicyKind) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_max_versions(mut self, max: u32) -> Self {
        self.max_versions = max;
        self
    }

    pub fn with_max_file_size(mut self, size: usize) -> Self {
        self.max_file_size = size;
        self
    }

    pub fn with_coverage(mut self, coverage: u32) -> Self {
        self.coverage = coverage;
        self
    }

    pub fn with_input_files(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_files = Some(path.into());
        self
    }

    pub fn with_validate_check(mut self, enabled: bool) -> Self {
        self.validate_check = enabled;
        self
    }

    /// Parse an option string such as `restore,file=app.csa,revive_policy=random`
    pub fn parse(options: &str) -> Result<Self> {
        let mut config = Config::default();
        let mut in_log = false;

        for token in options.split(',') {
            if token.is_empty() {
                return Err(Error::config(format!("empty option in \"{}\"", options)));
            }

            // `log=a=x,b=y` continues with bare `kind=level` tokens
            if in_log {
                if let Some((kind, level)) = token.split_once('=') {
                    if let (Some(kinds), Some(level)) = (LogKind::parse(kind), LogLevel::parse(level)) {
                        config.set_log_levels(&kinds, level);
                        continue;
                    }
                }
                in_log = false;
            }

            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (token, None),
            };

            match (key, value) {
                ("save", None) => config.save = true,
                ("restore", None) => config.restore = true,
                ("merge", None) => config.merge = true,
                ("print_opt", None) => config.print_opt = true,
                ("fatal_on_fail", None) => config.fatal_on_fail = true,
                ("perf", None) => config.perf = true,
                ("disable_validate_check", None) => config.validate_check = false,
                ("disable_constant_opt", None) => config.disable_constant_opt = true,
                ("verify_redefined_identity", None) => config.verify_redefined_identity = true,
                ("make_revive_fail_at_nmethod", None) => config.make_revive_fail_at_nmethod = true,
                ("file", Some(v)) => config.file = Some(parse_path(key, v)?),
                ("logfile", Some(v)) => config.log_file = Some(parse_path(key, v)?),
                ("input_files", Some(v)) => config.input_files = Some(parse_path(key, v)?),
                ("input_list_file", Some(v)) => config.input_list_file = Some(parse_path(key, v)?),
                ("log", Some(v)) => {
                    let (kind, level) = v
                        .split_once('=')
                        .ok_or_else(|| Error::config(format!("log option needs kind=level, got \"{}\"", v)))?;
                    let kinds = LogKind::parse(kind)
                        .ok_or_else(|| Error::config(format!("unknown log kind \"{}\"", kind)))?;
                    let level = LogLevel::parse(level)
                        .ok_or_else(|| Error::config(format!("unknown log level \"{}\"", level)))?;
                    config.set_log_levels(&kinds, level);
                    in_log = true;
                }
                ("revive_policy", Some(v)) => config.revive_policy = parse_revive_policy(v)?,
                ("policy", Some(v)) => {
                    config.merge_policy = match v {
                        "simple" => MergePolicyKind::Simple,
                        "coverage" => MergePolicyKind::Coverage,
                        _ => return Err(Error::config(format!("unknown merge policy \"{}\"", v))),
                    }
                }
                ("percent", Some(v)) => config.percent = parse_integer(key, v, 1, 99)?,
                ("coverage", Some(v)) => config.coverage = parse_integer(key, v, 1, 99)?,
                ("max_container_count", Some(v)) => {
                    config.max_container_count = parse_integer(key, v, 1, i32::MAX as u32)?
                }
                ("max_nmethod_versions", Some(v)) => {
                    config.max_versions = parse_integer(key, v, 1, MAX_VERSIONS_LIMIT)?
                }
                ("max_file_size", Some(v)) => config.max_file_size = parse_file_size(v)?,
                _ => return Err(Error::config(format!("unrecognized option \"{}\"", token))),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check option combinations
    pub fn validate(&self) -> Result<()> {
        if self.merge && (self.save || self.restore) {
            return Err(Error::config("merge can not be combined with save or restore"));
        }
        if self.percent != 100 && self.merge {
            return Err(Error::config("percent can not be combined with merge"));
        }
        if (self.save || self.restore || self.merge) && self.file.is_none() {
            return Err(Error::config("no file specified"));
        }
        if self.merge && self.input_files.is_none() && self.input_list_file.is_none() {
            return Err(Error::config("merge needs input_files or input_list_file"));
        }
        if self.max_versions == 0 || self.max_versions > MAX_VERSIONS_LIMIT {
            return Err(Error::config(format!(
                "max_nmethod_versions {} out of range [1:{}]",
                self.max_versions, MAX_VERSIONS_LIMIT
            )));
        }
        if self.max_file_size < M {
            return Err(Error::config("max_file_size must be at least 1M"));
        }
        Ok(())
    }

    /// Whether nothing was requested
    pub fn is_inactive(&self) -> bool {
        !self.save && !self.restore && !self.merge && !self.perf && !self.print_opt
    }

    /// Roll the `percent` dice once for this process
    pub fn sample_enabled(&self) -> bool {
        if self.percent >= 100 {
            return true;
        }
        rand::thread_rng().gen_range(0..100) < self.percent
    }

    /// Level configured for a log kind (`None` when unset)
    pub fn log_level(&self, kind: LogKind) -> LogLevel {
        self.log_levels
            .iter()
            .rev()
            .find(|(k, _)| *k == kind)
            .map(|(_, level)| *level)
            .unwrap_or(LogLevel::None)
    }

    /// `EnvFilter` directives equivalent to the configured log levels
    pub fn log_directives(&self) -> Vec<String> {
        LogKind::ALL
            .iter()
            .filter(|k| self.log_levels.iter().any(|(kind, _)| kind == *k))
            .map(|k| format!("{}={}", k.target(), self.log_level(*k).filter_level()))
            .collect()
    }

    fn set_log_levels(&mut self, kinds: &[LogKind], level: LogLevel) {
        for kind in kinds {
            self.log_levels.push((*kind, level));
        }
    }
}

fn parse_path(key: &str, value: &str) -> Result<PathBuf> {
    if value.is_empty() {
        return Err(Error::config(format!("{} needs a path", key)));
    }
    Ok(PathBuf::from(value))
}

fn parse_integer(name: &str, value: &str, min: u32, max: u32) -> Result<u32> {
    if value.starts_with('0') {
        return Err(Error::config(format!("{} leading zero at \"{}\"", name, value)));
    }
    let parsed: u32 = value
        .parse()
        .map_err(|_| Error::config(format!("{} no integer at \"{}\"", name, value)))?;
    if parsed < min || parsed > max {
        return Err(Error::config(format!(
            "{} {} out of range [{}:{}]",
            name, parsed, min, max
        )));
    }
    Ok(parsed)
}

fn parse_file_size(value: &str) -> Result<usize> {
    let (digits, unit) = match value.char_indices().last() {
        Some((i, 'M' | 'm')) => (&value[..i], M),
        Some((i, 'G' | 'g')) => (&value[..i], G),
        _ => return Err(Error::config("max_file_size must end with M or G")),
    };
    let n = parse_integer("max_file_size", digits, 1, i32::MAX as u32)? as usize;
    n.checked_mul(unit)
        .ok_or_else(|| Error::config(format!("max_file_size {} overflows", value)))
}

fn parse_revive_policy(value: &str) -> Result<RevivePolicyKind> {
    match value.split_once('=') {
        None => match value {
            "first" => Ok(RevivePolicyKind::First),
            "random" => Ok(RevivePolicyKind::Random),
            "appoint" => Ok(RevivePolicyKind::Appointed(0)),
            _ => Err(Error::config(format!("unknown revive_policy \"{}\"", value))),
        },
        Some(("appoint", arg)) => {
            let n = if arg == "0" {
                0
            } else {
                parse_integer("revive_policy", arg, 1, MAX_VERSIONS_LIMIT - 1)?
            };
            Ok(RevivePolicyKind::Appointed(n))
        }
        Some(_) => Err(Error::config(format!(
            "only appoint takes an argument, got \"{}\"",
            value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_restore() {
        let config = Config::parse("restore,file=app.csa,revive_policy=random").unwrap();
        assert!(config.restore);
        assert!(!config.save);
        assert_eq!(config.file, Some(PathBuf::from("app.csa")));
        assert_eq!(config.revive_policy, RevivePolicyKind::Random);
    }

    #[test]
    fn test_parse_merge_options() {
        let config = Config::parse(
            "merge,file=out.csa,input_files=dir,policy=coverage,coverage=80,max_nmethod_versions=4,max_file_size=64M",
        )
        .unwrap();
        assert_eq!(config.merge_policy, MergePolicyKind::Coverage);
        assert_eq!(config.coverage, 80);
        assert_eq!(config.max_versions, 4);
        assert_eq!(config.max_file_size, 64 * M);
    }

    #[test]
    fn test_parse_appoint_policy() {
        let config = Config::parse("restore,file=a.csa,revive_policy=appoint=3").unwrap();
        assert_eq!(config.revive_policy, RevivePolicyKind::Appointed(3));
        let config = Config::parse("restore,file=a.csa,revive_policy=appoint").unwrap();
        assert_eq!(config.revive_policy, RevivePolicyKind::Appointed(0));
    }

    #[test]
    fn test_parse_log_continuation() {
        let config = Config::parse("save,file=a.csa,log=save=trace,restore=fail,perf").unwrap();
        assert_eq!(config.log_level(LogKind::Save), LogLevel::Trace);
        assert_eq!(config.log_level(LogKind::Restore), LogLevel::Fail);
        assert_eq!(config.log_level(LogKind::Merge), LogLevel::None);
        assert!(config.perf);
        assert_eq!(
            config.log_directives(),
            vec![
                "code_revive::save=debug".to_string(),
                "code_revive::restore=error".to_string()
            ]
        );
    }

    #[test]
    fn test_parse_log_all() {
        let config = Config::parse("restore,file=a.csa,log=all=info").unwrap();
        for kind in LogKind::ALL {
            assert_eq!(config.log_level(kind), LogLevel::Info);
        }
    }

    #[test]
    fn test_reject_leading_zero() {
        assert!(Config::parse("restore,file=a.csa,percent=050").is_err());
        assert!(Config::parse("merge,file=a.csa,input_files=x,coverage=0").is_err());
    }

    #[test]
    fn test_reject_out_of_range() {
        assert!(Config::parse("restore,file=a.csa,percent=100").is_err());
        assert!(Config::parse("merge,file=a,input_files=x,max_nmethod_versions=33").is_err());
        assert!(Config::parse("merge,file=a,input_files=x,max_file_size=12").is_err());
    }

    #[test]
    fn test_reject_bad_combinations() {
        assert!(Config::parse("save,merge,file=a.csa,input_files=x").is_err());
        assert!(Config::parse("save").is_err());
        assert!(Config::parse("merge,file=out.csa").is_err());
        assert!(Config::parse("merge,file=o,input_files=x,percent=50").is_err());
    }

    #[test]
    fn test_reject_unknown() {
        assert!(Config::parse("restore,file=a.csa,bogus").is_err());
        assert!(Config::parse("restore,,file=a.csa").is_err());
    }

    #[test]
    fn test_sample_enabled_full_percent() {
        let config = Config::for_restore("a.csa");
        for _ in 0..10 {
            assert!(config.sample_enabled());
        }
    }
}
