use crate::dist::Dist;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_value::Value;
use std::{collections::BTreeMap, fmt, fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Intervention policy applied to a run.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// No intervention beyond isolating people who test positive.
    FreeMovement,
    /// App-based first-degree exposure notification.
    ExposureNotification,
    /// Reputation scores propagated through the contact graph.
    ReputationScore,
    /// Blanket lockdown with hysteresis.
    Lockdown,
}

impl Policy {
    pub const ALL: [Policy; 4] = [
        Policy::FreeMovement,
        Policy::ExposureNotification,
        Policy::ReputationScore,
        Policy::Lockdown,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Policy::FreeMovement => "free-movement",
            Policy::ExposureNotification => "exposure-notification",
            Policy::ReputationScore => "reputation-score",
            Policy::Lockdown => "lockdown",
        }
    }

    /// Whether the policy relies on a contact-tracing app.
    pub fn uses_app(self) -> bool {
        matches!(self, Policy::ExposureNotification | Policy::ReputationScore)
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Simulation configuration parameters.
///
/// Loaded from a TOML file (see [`Config::from_file`]) or from the
/// MessagePack payload of a run request, and validated before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of people.
    pub population: u32,
    /// Number of simulated days per run.
    pub days: u32,

    /// Minimum number of runs per policy before convergence is checked.
    pub runs_min: u32,
    /// Maximum number of runs per policy.
    pub runs_max: u32,
    /// Relative change in outcome variance below which a policy has converged.
    pub variance_tolerance: f64,

    /// Household size.
    pub household: Dist,
    /// Primary cluster size.
    pub cluster_size: Dist,
    /// Number of clusters each person belongs to.
    pub cluster_count: Dist,
    /// Size of the interaction groups formed within a visited cluster.
    pub group_size: Dist,
    /// Days from the end of the pre-symptomatic phase to recovery or death.
    pub illness: Dist,
    /// Days of immunity after recovery.
    pub immunity: Dist,
    /// Days between scheduling a test and getting the result.
    pub test_delay: Dist,

    pub infection_risk: f64,
    pub fatality_risk: f64,
    /// Expected number of imported infections per day across the population.
    pub foreign_imports: f64,
    pub symptomatic: f64,
    pub vaccinated: f64,
    pub key_workers: f64,
    pub pre_infectious_days: u32,
    pub pre_symptomatic_infectious_days: u32,

    pub public_clusters: f64,
    pub visit_foreign_cluster: f64,
    pub visit_public_cluster: f64,

    /// Daily test capacity as a fraction of the population.
    pub daily_test_capacity: f64,
    pub test_symptomatic: f64,
    pub test_notified: f64,
    pub test_key_workers: bool,
    pub test_key_worker: f64,

    pub isolation_days: u32,
    pub isolate_household: bool,
    pub isolation_effectiveness: f64,
    pub isolation_likelihood: f64,
    pub isolation_lockdown: f64,
    pub isolation_symptomatic: f64,

    /// Active infections at which lockdown starts.
    pub lockdown_start: u32,
    /// Active infections below which the lockdown may be eased.
    pub lockdown_end: u32,
    /// Consecutive days below `lockdown_end` before the lockdown ends.
    pub lockdown_end_window: u32,

    /// App adoption under the exposure-notification policy.
    pub exposure_app_installed: f64,
    /// App adoption under the reputation-score policy.
    pub score_app_installed: f64,
    pub install_household: bool,
    pub install_own: f64,
    pub install_foreign: f64,
    pub gatekept_clusters: f64,
    pub gatekept_threshold: u32,
    pub isolation_threshold: u32,
    pub exposed_visit: f64,
    pub second_degree_weight: f64,
    pub self_attestation: f64,
}

#[derive(Clone, Copy, Debug)]
enum FieldKind {
    Boolean,
    Distribution,
    Percentage,
    Score,
    Whole { min: i64 },
}

const FIELDS: &[(&str, FieldKind)] = &[
    ("population", FieldKind::Whole { min: 1 }),
    ("days", FieldKind::Whole { min: 1 }),
    ("runs_min", FieldKind::Whole { min: 1 }),
    ("runs_max", FieldKind::Whole { min: 1 }),
    ("variance_tolerance", FieldKind::Percentage),
    ("household", FieldKind::Distribution),
    ("cluster_size", FieldKind::Distribution),
    ("cluster_count", FieldKind::Distribution),
    ("group_size", FieldKind::Distribution),
    ("illness", FieldKind::Distribution),
    ("immunity", FieldKind::Distribution),
    ("test_delay", FieldKind::Distribution),
    ("infection_risk", FieldKind::Percentage),
    ("fatality_risk", FieldKind::Percentage),
    ("foreign_imports", FieldKind::Percentage),
    ("symptomatic", FieldKind::Percentage),
    ("vaccinated", FieldKind::Percentage),
    ("key_workers", FieldKind::Percentage),
    ("pre_infectious_days", FieldKind::Whole { min: 0 }),
    ("pre_symptomatic_infectious_days", FieldKind::Whole { min: 0 }),
    ("public_clusters", FieldKind::Percentage),
    ("visit_foreign_cluster", FieldKind::Percentage),
    ("visit_public_cluster", FieldKind::Percentage),
    ("daily_test_capacity", FieldKind::Percentage),
    ("test_symptomatic", FieldKind::Percentage),
    ("test_notified", FieldKind::Percentage),
    ("test_key_workers", FieldKind::Boolean),
    ("test_key_worker", FieldKind::Percentage),
    ("isolation_days", FieldKind::Whole { min: 1 }),
    ("isolate_household", FieldKind::Boolean),
    ("isolation_effectiveness", FieldKind::Percentage),
    ("isolation_likelihood", FieldKind::Percentage),
    ("isolation_lockdown", FieldKind::Percentage),
    ("isolation_symptomatic", FieldKind::Percentage),
    ("lockdown_start", FieldKind::Whole { min: 1 }),
    ("lockdown_end", FieldKind::Whole { min: 0 }),
    ("lockdown_end_window", FieldKind::Whole { min: 0 }),
    ("exposure_app_installed", FieldKind::Percentage),
    ("score_app_installed", FieldKind::Percentage),
    ("install_household", FieldKind::Boolean),
    ("install_own", FieldKind::Percentage),
    ("install_foreign", FieldKind::Percentage),
    ("gatekept_clusters", FieldKind::Percentage),
    ("gatekept_threshold", FieldKind::Score),
    ("isolation_threshold", FieldKind::Score),
    ("exposed_visit", FieldKind::Percentage),
    ("second_degree_weight", FieldKind::Percentage),
    ("self_attestation", FieldKind::Percentage),
];

impl Config {
    /// Load a [`Config`] from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, if a field is
    /// missing, unknown or of the wrong kind, or if a value is out of range.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let text = fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let raw: Value = toml::from_str(text).context("failed to parse config")?;

        check_fields(&raw).context("failed to check config fields")?;

        let config: Config = raw
            .deserialize_into()
            .context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    /// Encode as the MessagePack payload of a run request.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).context("failed to serialize config")
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        let config: Config =
            rmp_serde::from_slice(bytes).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    /// Look up one of the configured distributions by field name.
    pub fn distribution(&self, name: &str) -> Option<&Dist> {
        match name {
            "household" => Some(&self.household),
            "cluster_size" => Some(&self.cluster_size),
            "cluster_count" => Some(&self.cluster_count),
            "group_size" => Some(&self.group_size),
            "illness" => Some(&self.illness),
            "immunity" => Some(&self.immunity),
            "test_delay" => Some(&self.test_delay),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_num(self.population, 1..).context("invalid population")?;
        check_num(self.days, 1..).context("invalid number of days")?;
        check_num(self.runs_min, 1..).context("invalid minimum number of runs")?;
        check_num(self.runs_max, self.runs_min..).context("invalid maximum number of runs")?;
        check_num(self.isolation_days, 1..).context("invalid number of isolation days")?;
        check_num(self.lockdown_start, 1..).context("invalid lockdown start")?;

        let probs = [
            ("variance_tolerance", self.variance_tolerance),
            ("infection_risk", self.infection_risk),
            ("fatality_risk", self.fatality_risk),
            ("foreign_imports", self.foreign_imports),
            ("symptomatic", self.symptomatic),
            ("vaccinated", self.vaccinated),
            ("key_workers", self.key_workers),
            ("public_clusters", self.public_clusters),
            ("visit_foreign_cluster", self.visit_foreign_cluster),
            ("visit_public_cluster", self.visit_public_cluster),
            ("daily_test_capacity", self.daily_test_capacity),
            ("test_symptomatic", self.test_symptomatic),
            ("test_notified", self.test_notified),
            ("test_key_worker", self.test_key_worker),
            ("isolation_effectiveness", self.isolation_effectiveness),
            ("isolation_likelihood", self.isolation_likelihood),
            ("isolation_lockdown", self.isolation_lockdown),
            ("isolation_symptomatic", self.isolation_symptomatic),
            ("exposure_app_installed", self.exposure_app_installed),
            ("score_app_installed", self.score_app_installed),
            ("install_own", self.install_own),
            ("install_foreign", self.install_foreign),
            ("gatekept_clusters", self.gatekept_clusters),
            ("exposed_visit", self.exposed_visit),
            ("second_degree_weight", self.second_degree_weight),
            ("self_attestation", self.self_attestation),
        ];
        for (name, prob) in probs {
            check_num(prob, 0.0..=1.0).with_context(|| format!("invalid {name}"))?;
        }

        check_num(self.gatekept_threshold, 0..=100).context("invalid gatekept threshold")?;
        check_num(self.isolation_threshold, 0..=100).context("invalid isolation threshold")?;

        let dists = [
            ("household", &self.household),
            ("cluster_size", &self.cluster_size),
            ("cluster_count", &self.cluster_count),
            ("group_size", &self.group_size),
            ("illness", &self.illness),
            ("immunity", &self.immunity),
            ("test_delay", &self.test_delay),
        ];
        for (name, dist) in dists {
            dist.validate()
                .with_context(|| format!("invalid {name} distribution"))?;
        }
        check_num(self.household.min(), 1..).context("invalid household distribution")?;
        check_num(self.cluster_size.min(), 1..).context("invalid cluster size distribution")?;
        check_num(self.group_size.min(), 1..).context("invalid group size distribution")?;

        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_fields(raw: &Value) -> Result<()> {
    let Value::Map(map) = raw else {
        bail!("config must be a table");
    };
    let fields = string_keys(map)?;

    for (name, _) in &fields {
        if !FIELDS.iter().any(|(known, _)| known == name) {
            bail!("config has field {name:?} which is not recognised");
        }
    }

    for &(name, kind) in FIELDS {
        let Some(value) = fields.get(name) else {
            bail!("config is missing field {name:?}");
        };
        check_field(value, kind).with_context(|| format!("invalid value for {name:?}"))?;
    }

    Ok(())
}

fn check_field(value: &Value, kind: FieldKind) -> Result<()> {
    match kind {
        FieldKind::Boolean => {
            if !matches!(value, Value::Bool(_)) {
                bail!("value must be a boolean");
            }
        }
        FieldKind::Whole { min } => {
            let Some(num) = as_whole(value) else {
                bail!("value must be a whole number");
            };
            if num < min {
                bail!("value must be at least {min}, but is {num}");
            }
        }
        FieldKind::Percentage => {
            let Some(num) = as_number(value) else {
                bail!("value must be a number");
            };
            check_num(num, 0.0..=1.0).context("value must be a percentage")?;
        }
        FieldKind::Score => {
            let Some(num) = as_whole(value) else {
                bail!("value must be a whole number");
            };
            check_num(num, 0..=100).context("value must be a score")?;
        }
        FieldKind::Distribution => check_distribution(value)?,
    }
    Ok(())
}

fn check_distribution(value: &Value) -> Result<()> {
    let Value::Map(map) = value else {
        bail!("value must be a distribution table");
    };
    let params = string_keys(map)?;

    let Some(Value::String(kind)) = params.get("kind") else {
        bail!("distribution must have a string \"kind\"");
    };
    let expected: &[&str] = match kind.as_str() {
        "normal" => &["kind", "mean", "min"],
        "poisson" => &["kind", "mean", "min", "max"],
        "zipf" => &["kind", "min", "max"],
        _ => bail!("unknown distribution kind {kind:?}"),
    };

    for (name, param) in &params {
        if !expected.contains(name) {
            bail!("{kind} distribution has parameter {name:?} which is not recognised");
        }
        match *name {
            "kind" => {}
            "mean" => {
                if as_number(param).is_none() {
                    bail!("parameter \"mean\" must be a number");
                }
            }
            _ => {
                if !as_whole(param).is_some_and(|num| num >= 0) {
                    bail!("parameter {name:?} must be a non-negative whole number");
                }
            }
        }
    }
    for name in expected {
        if !params.contains_key(name) {
            bail!("{kind} distribution is missing parameter {name:?}");
        }
    }

    Ok(())
}

fn string_keys(map: &BTreeMap<Value, Value>) -> Result<BTreeMap<&str, &Value>> {
    map.iter()
        .map(|(key, value)| match key {
            Value::String(key) => Ok((key.as_str(), value)),
            _ => bail!("table keys must be strings, but found {key:?}"),
        })
        .collect()
}

fn as_whole(value: &Value) -> Option<i64> {
    match *value {
        Value::I8(n) => Some(n.into()),
        Value::I16(n) => Some(n.into()),
        Value::I32(n) => Some(n.into()),
        Value::I64(n) => Some(n),
        Value::U8(n) => Some(n.into()),
        Value::U16(n) => Some(n.into()),
        Value::U32(n) => Some(n.into()),
        Value::U64(n) => i64::try_from(n).ok(),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match *value {
        Value::F32(n) => Some(n.into()),
        Value::F64(n) => Some(n),
        _ => as_whole(value).map(|n| n as f64),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small but complete configuration.
    pub(crate) const SMALL: &str = r#"
population = 400
days = 40
runs_min = 2
runs_max = 4
variance_tolerance = 0.1

household = { kind = "poisson", mean = 2.1, min = 1, max = 6 }
cluster_size = { kind = "poisson", mean = 20, min = 1, max = 50 }
cluster_count = { kind = "zipf", min = 1, max = 20 }
group_size = { kind = "poisson", mean = 2.5, min = 2, max = 20 }
illness = { kind = "normal", mean = 10.5, min = 7 }
immunity = { kind = "normal", mean = 238, min = 0 }
test_delay = { kind = "poisson", mean = 2, min = 1, max = 10 }

infection_risk = 0.01
fatality_risk = 0.01
foreign_imports = 0.06
symptomatic = 0.33
vaccinated = 0
key_workers = 0.16
pre_infectious_days = 3
pre_symptomatic_infectious_days = 3

public_clusters = 0.15
visit_foreign_cluster = 0.2
visit_public_cluster = 0.15

daily_test_capacity = 0.005
test_symptomatic = 0.6
test_notified = 0.9
test_key_workers = false
test_key_worker = 0.1

isolation_days = 21
isolate_household = true
isolation_effectiveness = 0.9
isolation_likelihood = 0.9
isolation_lockdown = 0.9
isolation_symptomatic = 0.9

lockdown_start = 15
lockdown_end = 5
lockdown_end_window = 14

exposure_app_installed = 0.66
score_app_installed = 0.66
install_household = false
install_own = 0
install_foreign = 0
gatekept_clusters = 0.33
gatekept_threshold = 50
isolation_threshold = 50
exposed_visit = 0.2
second_degree_weight = 1
self_attestation = 0
"#;

    fn error_chain(text: &str) -> String {
        let error = Config::from_toml(text).expect_err("config should be rejected");
        format!("{error:#}")
    }

    #[test]
    fn accepts_complete_config() {
        let cfg = Config::from_toml(SMALL).expect("config should be valid");
        assert_eq!(cfg.population, 400);
        assert_eq!(
            cfg.household,
            Dist::Poisson {
                mean: 2.1,
                min: 1,
                max: 6
            }
        );
    }

    #[test]
    fn rejects_unknown_field() {
        let text = format!("{SMALL}\nimage_font = \"serif\"\n");
        assert!(error_chain(&text).contains("\"image_font\""));
    }

    #[test]
    fn rejects_missing_field() {
        let text = SMALL.replace("fatality_risk = 0.01\n", "");
        assert!(error_chain(&text).contains("missing field \"fatality_risk\""));
    }

    #[test]
    fn rejects_fractional_whole_number() {
        let text = SMALL.replace("days = 40", "days = 40.5");
        let error = error_chain(&text);
        assert!(error.contains("\"days\""));
        assert!(error.contains("whole number"));
    }

    #[test]
    fn rejects_out_of_range_percentage() {
        let text = SMALL.replace("infection_risk = 0.01", "infection_risk = 1.5");
        let error = error_chain(&text);
        assert!(error.contains("\"infection_risk\""));
        assert!(error.contains("percentage"));
    }

    #[test]
    fn rejects_bad_score_and_boolean() {
        let text = SMALL.replace("gatekept_threshold = 50", "gatekept_threshold = 101");
        assert!(error_chain(&text).contains("\"gatekept_threshold\""));

        let text = SMALL.replace("isolate_household = true", "isolate_household = 1");
        assert!(error_chain(&text).contains("boolean"));
    }

    #[test]
    fn rejects_bad_distribution() {
        let text = SMALL.replace(
            "cluster_count = { kind = \"zipf\", min = 1, max = 20 }",
            "cluster_count = { kind = \"zipf\", min = 1, max = 20, mean = 3 }",
        );
        assert!(error_chain(&text).contains("\"mean\""));

        let text = SMALL.replace(
            "cluster_count = { kind = \"zipf\", min = 1, max = 20 }",
            "cluster_count = { kind = \"zipf\", min = 21, max = 20 }",
        );
        assert!(error_chain(&text).contains("cluster_count"));
    }

    #[test]
    fn rejects_inverted_run_limits() {
        let text = SMALL.replace("runs_max = 4", "runs_max = 1");
        assert!(error_chain(&text).contains("maximum number of runs"));
    }

    #[test]
    fn msgpack_payload_round_trips() {
        let cfg = Config::from_toml(SMALL).expect("config should be valid");
        let bytes = cfg.to_msgpack().expect("config should encode");
        let decoded = Config::from_msgpack(&bytes).expect("config should decode");
        assert_eq!(cfg, decoded);
    }
}
