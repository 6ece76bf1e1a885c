//! Scheduling options carried in the `[X-Fleet]` section.

use std::collections::{BTreeMap, BTreeSet};

use flotilla_id::{UnitName, UnitNameInfo};

use crate::{ResourceTuple, UnitFile, UnitFileError};

/// Section holding scheduling options.
pub const FLEET_SECTION: &str = "X-Fleet";

const MACHINE_ID: &str = "MachineID";
const MACHINE_BOOT_ID: &str = "MachineBootID";
const MACHINE_OF: &str = "MachineOf";
const CONFLICTS: &str = "Conflicts";
const MACHINE_METADATA: &str = "MachineMetadata";
const GLOBAL: &str = "Global";
const CORES: &str = "Cores";
const MEMORY_MB: &str = "MemoryMB";
const DISK_MB: &str = "DiskMB";

const DEPRECATED_X_PREFIX: &str = "X-";
const DEPRECATED_CONDITION_PREFIX: &str = "X-Condition";

/// Every key accepted in the `[X-Fleet]` section.
fn is_known_option(key: &str) -> bool {
    const KNOWN: &[&str] = &[
        MACHINE_ID,
        MACHINE_OF,
        CONFLICTS,
        MACHINE_METADATA,
        GLOBAL,
        CORES,
        MEMORY_MB,
        DISK_MB,
    ];
    if KNOWN.contains(&key) {
        return true;
    }
    match key.strip_prefix(DEPRECATED_CONDITION_PREFIX) {
        Some(rest) => matches!(rest, MACHINE_ID | MACHINE_BOOT_ID | MACHINE_OF | MACHINE_METADATA),
        None => key.strip_prefix(DEPRECATED_X_PREFIX) == Some(CONFLICTS),
    }
}

/// Placement constraints of one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulingOptions {
    /// Machine the unit is pinned to (full or short id).
    pub machine_id: Option<String>,
    /// Units that must share a machine with this one.
    pub peers: Vec<String>,
    /// Glob patterns of units that must not share a machine with this one.
    pub conflicts: Vec<String>,
    /// Required machine metadata; values of one key are alternatives.
    pub metadata: BTreeMap<String, BTreeSet<String>>,
    /// Run on every machine whose metadata matches instead of being scheduled.
    pub global: bool,
    /// Reserved resources.
    pub resources: ResourceTuple,
}

impl SchedulingOptions {
    /// Extract and validate the options of `file`, expanding `%n %N %p %i`
    /// against `name`.
    pub fn from_unit(name: &UnitName, file: &UnitFile) -> Result<Self, UnitFileError> {
        let info = name.info();
        let mut requirements: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for opt in file.section(FLEET_SECTION) {
            if !is_known_option(&opt.name) {
                return Err(UnitFileError::UnknownOption(opt.name.clone()));
            }
            requirements
                .entry(opt.name.as_str())
                .or_default()
                .push(expand_specifiers(&opt.value, &info));
        }

        let values = |key: &str| -> Vec<String> { requirements.get(key).cloned().unwrap_or_default() };
        let condition = |key: &str| values(&format!("{DEPRECATED_CONDITION_PREFIX}{key}"));

        let machine_id = values(MACHINE_ID)
            .into_iter()
            .chain(condition(MACHINE_ID))
            .chain(condition(MACHINE_BOOT_ID))
            .find(|v| !v.is_empty());

        let mut peers = condition(MACHINE_OF);
        peers.extend(values(MACHINE_OF));
        peers.retain(|p| !p.is_empty());

        let mut conflicts = values(&format!("{DEPRECATED_X_PREFIX}{CONFLICTS}"));
        conflicts.extend(values(CONFLICTS));
        conflicts.retain(|c| !c.is_empty());

        let mut metadata: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for pair in condition(MACHINE_METADATA).into_iter().chain(values(MACHINE_METADATA)) {
            let mut parts = pair.split('=');
            let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            if key.is_empty() || value.is_empty() {
                continue;
            }
            metadata
                .entry(key.to_string())
                .or_default()
                .insert(value.to_string());
        }

        // Last value wins.
        let global = values(GLOBAL)
            .last()
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let resources = ResourceTuple {
            cores: parse_last(&values(CORES), CORES)?,
            memory_mb: parse_last(&values(MEMORY_MB), MEMORY_MB)?,
            disk_mb: parse_last(&values(DISK_MB), DISK_MB)?,
        };

        Ok(Self {
            machine_id,
            peers,
            conflicts,
            metadata,
            global,
            resources,
        })
    }

    /// True if the machine metadata satisfies every required key.
    pub fn metadata_satisfied_by(&self, machine: &BTreeMap<String, String>) -> bool {
        self.metadata.iter().all(|(key, allowed)| {
            machine
                .get(key)
                .is_some_and(|value| allowed.contains(value))
        })
    }

    /// True if this unit declares a conflict with `other`.
    pub fn conflicts_with(&self, other: &str) -> bool {
        self.conflicts.iter().any(|pattern| glob_matches(pattern, other))
    }
}

fn parse_last<T: std::str::FromStr + Default>(values: &[String], option: &str) -> Result<T, UnitFileError> {
    let Some(raw) = values.last() else {
        return Ok(T::default());
    };
    raw.trim().parse().map_err(|_| UnitFileError::InvalidValue {
        option: option.to_string(),
        value: raw.clone(),
        reason: "expected a non-negative integer".to_string(),
    })
}

fn expand_specifiers(value: &str, info: &UnitNameInfo) -> String {
    value
        .replace("%n", &info.full_name)
        .replace("%N", &info.name)
        .replace("%p", &info.prefix)
        .replace("%i", &info.instance)
}

/// Shell-style glob match supporting `*`, `?` and `[...]` classes.
///
/// A malformed class never matches. Only the most recent `*` is ever
/// backtracked to, so a match costs at most pattern length times name
/// length.
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    let Some(tokens) = tokenize(pattern) else {
        return false;
    };
    let name: Vec<char> = name.chars().collect();

    let (mut t, mut n) = (0, 0);
    // Token after the last `*` and the name position it was tried at.
    let mut resume: Option<(usize, usize)> = None;
    while n < name.len() {
        match tokens.get(t) {
            Some(GlobToken::Star) => {
                t += 1;
                resume = Some((t, n));
                continue;
            }
            Some(token) if token.matches(name[n]) => {
                t += 1;
                n += 1;
                continue;
            }
            _ => {}
        }
        match resume {
            Some((star_t, star_n)) => {
                t = star_t;
                n = star_n + 1;
                resume = Some((star_t, n));
            }
            None => return false,
        }
    }
    tokens[t..].iter().all(|token| matches!(token, GlobToken::Star))
}

#[derive(Debug, PartialEq, Eq)]
enum GlobToken {
    Star,
    Any,
    Literal(char),
    Class {
        negated: bool,
        ranges: Vec<(char, char)>,
    },
}

impl GlobToken {
    fn matches(&self, c: char) -> bool {
        match self {
            Self::Star | Self::Any => true,
            Self::Literal(l) => *l == c,
            Self::Class { negated, ranges } => {
                ranges.iter().any(|(lo, hi)| *lo <= c && c <= *hi) != *negated
            }
        }
    }
}

/// Split a pattern into tokens; `None` when a class is never closed.
fn tokenize(pattern: &str) -> Option<Vec<GlobToken>> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                // Runs of stars behave as one.
                if tokens.last() != Some(&GlobToken::Star) {
                    tokens.push(GlobToken::Star);
                }
                i += 1;
            }
            '?' => {
                tokens.push(GlobToken::Any);
                i += 1;
            }
            '\\' if i + 1 < chars.len() => {
                tokens.push(GlobToken::Literal(chars[i + 1]));
                i += 2;
            }
            '[' => {
                let (token, next) = parse_class(&chars, i + 1)?;
                tokens.push(token);
                i = next;
            }
            c => {
                tokens.push(GlobToken::Literal(c));
                i += 1;
            }
        }
    }
    Some(tokens)
}

/// Parse the class starting after `[`; returns it and the index after `]`.
fn parse_class(chars: &[char], start: usize) -> Option<(GlobToken, usize)> {
    let (negated, mut i) = match chars.get(start) {
        Some('^') | Some('!') => (true, start + 1),
        _ => (false, start),
    };
    let mut ranges = Vec::new();
    let mut first = true;
    loop {
        let lo = *chars.get(i)?;
        if lo == ']' && !first {
            return Some((GlobToken::Class { negated, ranges }, i + 1));
        }
        first = false;
        if chars.get(i + 1) == Some(&'-') && chars.get(i + 2).is_some_and(|hi| *hi != ']') {
            ranges.push((lo, chars[i + 2]));
            i += 3;
        } else {
            ranges.push((lo, lo));
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn options(name: &str, fleet: &str) -> Result<SchedulingOptions, UnitFileError> {
        let file = UnitFile::parse(&format!("[Service]\nExecStart=/bin/true\n[X-Fleet]\n{fleet}")).unwrap();
        SchedulingOptions::from_unit(&name.parse().unwrap(), &file)
    }

    #[test]
    fn test_empty_options() {
        let opts = options("a.service", "").unwrap();
        assert_eq!(opts, SchedulingOptions::default());
    }

    #[test]
    fn test_pin_prefers_current_key() {
        let opts = options("a.service", "X-ConditionMachineID=old\nMachineID=new\n").unwrap();
        assert_eq!(opts.machine_id.as_deref(), Some("new"));
    }

    #[test]
    fn test_deprecated_keys_accepted() {
        let opts = options(
            "a.service",
            "X-ConditionMachineOf=b.service\nX-Conflicts=c*.service\nX-ConditionMachineMetadata=region=eu\n",
        )
        .unwrap();
        assert_eq!(opts.peers, vec!["b.service"]);
        assert_eq!(opts.conflicts, vec!["c*.service"]);
        assert!(opts.metadata["region"].contains("eu"));
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = options("a.service", "Replicas=3\n").unwrap_err();
        assert_eq!(err, UnitFileError::UnknownOption("Replicas".to_string()));
    }

    #[test]
    fn test_specifiers_expanded() {
        let opts = options("web@2.service", "Conflicts=%p@*.service\nMachineOf=db@%i.service\n").unwrap();
        assert_eq!(opts.conflicts, vec!["web@*.service"]);
        assert_eq!(opts.peers, vec!["db@2.service"]);
    }

    #[test]
    fn test_metadata_alternatives() {
        let opts = options("a.service", "MachineMetadata=\"region=us\" \"region=eu\" \"disk=ssd\"\n").unwrap();
        let mut machine = BTreeMap::new();
        machine.insert("region".to_string(), "eu".to_string());
        assert!(!opts.metadata_satisfied_by(&machine));
        machine.insert("disk".to_string(), "ssd".to_string());
        assert!(opts.metadata_satisfied_by(&machine));
        machine.insert("region".to_string(), "ap".to_string());
        assert!(!opts.metadata_satisfied_by(&machine));
    }

    #[test]
    fn test_malformed_metadata_ignored() {
        let opts = options("a.service", "MachineMetadata=novalue\nMachineMetadata=a=b=c\n").unwrap();
        assert!(opts.metadata.is_empty());
    }

    #[test]
    fn test_global_last_value_wins() {
        assert!(options("a.service", "Global=false\nGlobal=TRUE\n").unwrap().global);
        assert!(!options("a.service", "Global=true\nGlobal=no\n").unwrap().global);
    }

    #[test]
    fn test_resources() {
        let opts = options("a.service", "Cores=150\nMemoryMB=512\n").unwrap();
        assert_eq!(opts.resources, ResourceTuple::new(150, 512, 0));

        let err = options("a.service", "MemoryMB=lots\n").unwrap_err();
        assert!(matches!(err, UnitFileError::InvalidValue { .. }));
    }

    #[rstest]
    #[case("*.service", "web.service", true)]
    #[case("web@*.service", "web@1.service", true)]
    #[case("web@*.service", "api@1.service", false)]
    #[case("web?.service", "web1.service", true)]
    #[case("web?.service", "web.service", false)]
    #[case("web[0-9].service", "web7.service", true)]
    #[case("web[!0-9].service", "web7.service", false)]
    #[case("web[abc.service", "weba.service", false)]
    #[case("exact.service", "exact.service", true)]
    #[case("*", "", true)]
    #[case("a*", "", false)]
    #[case("*web*", "a-web-b.service", true)]
    #[case("**.service", "x.service", true)]
    #[case("*a*b", "aaab", true)]
    #[case("*a*b", "aaba", false)]
    #[case("\\*.service", "*.service", true)]
    #[case("\\*.service", "a.service", false)]
    fn test_glob(#[case] pattern: &str, #[case] name: &str, #[case] expected: bool) {
        assert_eq!(glob_matches(pattern, name), expected);
    }

    fn naive_glob(pattern: &[char], name: &[char]) -> bool {
        match pattern.first() {
            None => name.is_empty(),
            Some('*') => (0..=name.len()).any(|skip| naive_glob(&pattern[1..], &name[skip..])),
            Some('?') => !name.is_empty() && naive_glob(&pattern[1..], &name[1..]),
            Some(c) => name.first() == Some(c) && naive_glob(&pattern[1..], &name[1..]),
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_glob_agrees_with_backtracking(pattern in "[ab*?]{0,8}", name in "[ab]{0,10}") {
            let p: Vec<char> = pattern.chars().collect();
            let n: Vec<char> = name.chars().collect();
            proptest::prop_assert_eq!(glob_matches(&pattern, &name), naive_glob(&p, &n));
        }
    }

    #[test]
    fn test_glob_many_stars_is_fast() {
        let pattern = format!("{}b", "*a".repeat(64));
        let name = format!("{}.service", "a".repeat(248));
        let started = std::time::Instant::now();
        assert!(!glob_matches(&pattern, &name));
        assert!(glob_matches(&pattern, &format!("{}b", "a".repeat(255))));
        assert!(started.elapsed() < std::time::Duration::from_millis(50));
    }
}
