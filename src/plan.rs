//! Sweep plans: the ordered steps of one experiment run, loaded from JSON.

use crate::model::ParamValue;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

fn default_directory() -> String {
    "data".to_string()
}

fn default_unique() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    /// Experiment directory name relative to the session root.
    #[serde(default = "default_directory")]
    pub directory: String,
    #[serde(default = "default_unique")]
    pub unique: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Open {
        file: String,
    },
    Close {
        file: String,
    },
    SaveAs {
        file: String,
    },
    SetParam {
        name: String,
        value: ParamValue,
    },
    GetParam {
        name: String,
    },
    SetTable {
        name: String,
        values: String,
    },
    GetTable {
        name: String,
    },
    Zg {
        #[serde(default)]
        manual_check: bool,
    },
    Sleep {
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    Log {
        message: String,
    },
    LogValues {
        values: Vec<ParamValue>,
    },
    Reset,
    /// Run `steps` once per value, with `{var}` and `{var_index}` bound.
    Sweep {
        var: String,
        values: Vec<ParamValue>,
        steps: Vec<Step>,
    },
}

/// Placeholder bindings active while expanding nested sweeps.
pub type Bindings = BTreeMap<String, ParamValue>;

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read plan {}", path.display()))?;
        let plan: Plan = serde_json::from_str(&raw)
            .with_context(|| format!("parse plan {}", path.display()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Reject plans that cannot run: no steps, empty sweeps, reused sweep
    /// variables, or placeholders with nothing bound to them.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.steps.is_empty(), "plan has no steps");
        validate_steps(&self.steps, &mut Vec::new())
    }

    /// Number of steps a run executes once sweeps are unrolled.
    pub fn executed_steps(&self) -> usize {
        count_steps(&self.steps)
    }

    /// Number of acquisitions a run triggers once sweeps are unrolled.
    pub fn acquisitions(&self) -> usize {
        count_acquisitions(&self.steps)
    }

    /// Unroll sweeps into the flat list of steps a run executes, with all
    /// placeholders substituted.
    pub fn expand(&self) -> Vec<Step> {
        let mut out = Vec::with_capacity(self.executed_steps());
        expand_into(&self.steps, &mut Bindings::new(), &mut out);
        out
    }
}

impl Step {
    /// One-line description for logs and error context.
    pub fn describe(&self) -> String {
        match self {
            Step::Open { file } => format!("open {file}"),
            Step::Close { file } => format!("close {file}"),
            Step::SaveAs { file } => format!("save as {file}"),
            Step::SetParam { name, value } => format!("set {name} = {value}"),
            Step::GetParam { name } => format!("get {name}"),
            Step::SetTable { name, values } => format!("set table {name} = {values}"),
            Step::GetTable { name } => format!("get table {name}"),
            Step::Zg { manual_check: true } => "zg (manual check)".to_string(),
            Step::Zg { manual_check: false } => "zg".to_string(),
            Step::Sleep { duration } => {
                format!("sleep {}", humantime::format_duration(*duration))
            }
            Step::Log { message } => format!("log {message:?}"),
            Step::LogValues { values } => format!("log {} values", values.len()),
            Step::Reset => "reset".to_string(),
            Step::Sweep { var, values, .. } => format!("sweep {var} over {} values", values.len()),
        }
    }

    fn bind(&self, b: &Bindings) -> Step {
        match self {
            Step::Open { file } => Step::Open {
                file: substitute(file, b),
            },
            Step::Close { file } => Step::Close {
                file: substitute(file, b),
            },
            Step::SaveAs { file } => Step::SaveAs {
                file: substitute(file, b),
            },
            Step::SetParam { name, value } => Step::SetParam {
                name: substitute(name, b),
                value: substitute_value(value, b),
            },
            Step::GetParam { name } => Step::GetParam {
                name: substitute(name, b),
            },
            Step::SetTable { name, values } => Step::SetTable {
                name: substitute(name, b),
                values: substitute(values, b),
            },
            Step::GetTable { name } => Step::GetTable {
                name: substitute(name, b),
            },
            Step::Log { message } => Step::Log {
                message: substitute(message, b),
            },
            Step::LogValues { values } => Step::LogValues {
                values: values.iter().map(|v| substitute_value(v, b)).collect(),
            },
            other => other.clone(),
        }
    }
}

fn expand_into(steps: &[Step], bindings: &mut Bindings, out: &mut Vec<Step>) {
    for step in steps {
        match step {
            Step::Sweep { var, values, steps } => {
                let index_key = format!("{var}_index");
                for (i, value) in values.iter().enumerate() {
                    bindings.insert(var.clone(), value.clone());
                    bindings.insert(index_key.clone(), ParamValue::Int(i as i64));
                    expand_into(steps, bindings, out);
                }
                bindings.remove(var);
                bindings.remove(&index_key);
            }
            other => out.push(other.bind(bindings)),
        }
    }
}

fn count_steps(steps: &[Step]) -> usize {
    steps
        .iter()
        .map(|s| match s {
            Step::Sweep { values, steps, .. } => values.len() * count_steps(steps),
            _ => 1,
        })
        .sum()
}

fn count_acquisitions(steps: &[Step]) -> usize {
    steps
        .iter()
        .map(|s| match s {
            Step::Sweep { values, steps, .. } => values.len() * count_acquisitions(steps),
            Step::Zg { .. } => 1,
            _ => 0,
        })
        .sum()
}

fn step_texts(step: &Step) -> Vec<&str> {
    match step {
        Step::Open { file } | Step::Close { file } | Step::SaveAs { file } => vec![file.as_str()],
        Step::SetParam { name, value } => match value {
            ParamValue::Text(v) => vec![name.as_str(), v.as_str()],
            _ => vec![name.as_str()],
        },
        Step::GetParam { name } | Step::GetTable { name } => vec![name.as_str()],
        Step::SetTable { name, values } => vec![name.as_str(), values.as_str()],
        Step::Log { message } => vec![message.as_str()],
        Step::LogValues { values } => values
            .iter()
            .filter_map(|v| match v {
                ParamValue::Text(s) => Some(s.as_str()),
                _ => None,
            })
            .collect(),
        Step::Zg { .. } | Step::Sleep { .. } | Step::Reset | Step::Sweep { .. } => Vec::new(),
    }
}

/// Names inside `{...}` in `text`.
fn placeholders(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                out.push(&after[..end]);
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    out
}

fn validate_steps(steps: &[Step], bound: &mut Vec<String>) -> Result<()> {
    for step in steps {
        if let Step::Sweep { var, values, steps } = step {
            anyhow::ensure!(!var.trim().is_empty(), "sweep variable name is empty");
            anyhow::ensure!(!values.is_empty(), "sweep over {var} has no values");
            anyhow::ensure!(!steps.is_empty(), "sweep over {var} has no steps");
            anyhow::ensure!(
                !bound.iter().any(|b| b == var),
                "sweep variable {var} is already bound by an enclosing sweep"
            );
            bound.push(var.clone());
            let res = validate_steps(steps, bound);
            bound.pop();
            res?;
            continue;
        }
        for text in step_texts(step) {
            for name in placeholders(text) {
                let known = bound
                    .iter()
                    .any(|b| name == b.as_str() || name.strip_suffix("_index") == Some(b.as_str()));
                anyhow::ensure!(known, "unknown placeholder {{{name}}} in {text:?}");
            }
        }
    }
    Ok(())
}

/// Replace `{var}` and `{var_index}` placeholders.
pub fn substitute(text: &str, bindings: &Bindings) -> String {
    let mut out = text.to_string();
    for (name, value) in bindings {
        out = out.replace(&format!("{{{name}}}"), &value.to_string());
    }
    out
}

/// Substitute into a parameter value. A value that is exactly one
/// placeholder takes the bound value with its type.
pub fn substitute_value(value: &ParamValue, bindings: &Bindings) -> ParamValue {
    match value {
        ParamValue::Text(text) => {
            let exact = text
                .strip_prefix('{')
                .and_then(|t| t.strip_suffix('}'))
                .and_then(|name| bindings.get(name));
            match exact {
                Some(v) => v.clone(),
                None => ParamValue::Text(substitute(text, bindings)),
            }
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECEIVER_GAIN: &str = r#"{
        "directory": "data",
        "steps": [
            { "op": "open", "file": "templates/RO" },
            { "op": "sweep", "var": "gain", "values": [60, 61, 62], "steps": [
                { "op": "log", "message": "rec_gain = {gain}" },
                { "op": "set_param", "name": "Receiver Gain", "value": "{gain}" },
                { "op": "zg" },
                { "op": "save_as", "file": "RO_RecGain{gain}_{gain_index}" },
                { "op": "sleep", "duration": "1s" }
            ]}
        ]
    }"#;

    #[test]
    fn parses_and_counts() {
        let plan: Plan = serde_json::from_str(RECEIVER_GAIN).unwrap();
        plan.validate().unwrap();
        assert!(plan.unique);
        assert_eq!(plan.executed_steps(), 1 + 3 * 5);
        assert_eq!(plan.acquisitions(), 3);
        match &plan.steps[1] {
            Step::Sweep { steps, .. } => match &steps[4] {
                Step::Sleep { duration } => assert_eq!(*duration, Duration::from_secs(1)),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn expansion_unrolls_sweeps_in_order() {
        let plan: Plan = serde_json::from_str(RECEIVER_GAIN).unwrap();
        let steps = plan.expand();
        assert_eq!(steps.len(), plan.executed_steps());
        let saves: Vec<String> = steps
            .iter()
            .filter_map(|s| match s {
                Step::SaveAs { file } => Some(file.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(saves, ["RO_RecGain60_0", "RO_RecGain61_1", "RO_RecGain62_2"]);
        match &steps[2] {
            Step::SetParam { value, .. } => assert_eq!(*value, ParamValue::Int(60)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn nested_sweeps_see_outer_bindings() {
        let plan: Plan = serde_json::from_str(
            r#"{ "steps": [ { "op": "sweep", "var": "j", "values": [0, 1], "steps": [
                { "op": "sweep", "var": "f", "values": [2.25, "2.3"], "steps": [
                    { "op": "save_as", "file": "FID_{j}_{f}" }
                ] }
            ] } ] }"#,
        )
        .unwrap();
        plan.validate().unwrap();
        let files: Vec<String> = plan
            .expand()
            .into_iter()
            .map(|s| match s {
                Step::SaveAs { file } => file,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(files, ["FID_0_2.25", "FID_0_2.3", "FID_1_2.25", "FID_1_2.3"]);
    }

    #[test]
    fn unknown_placeholder_is_rejected() {
        let plan: Plan = serde_json::from_str(
            r#"{ "steps": [ { "op": "save_as", "file": "FID_{j}" } ] }"#,
        )
        .unwrap();
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("{j}"));
    }

    #[test]
    fn empty_plans_and_sweeps_are_rejected() {
        let plan: Plan = serde_json::from_str(r#"{ "steps": [] }"#).unwrap();
        assert!(plan.validate().is_err());
        let plan: Plan = serde_json::from_str(
            r#"{ "steps": [ { "op": "sweep", "var": "j", "values": [], "steps": [ { "op": "zg" } ] } ] }"#,
        )
        .unwrap();
        assert!(plan.validate().is_err());
    }

    #[test]
    fn shadowed_sweep_variable_is_rejected() {
        let plan: Plan = serde_json::from_str(
            r#"{ "steps": [ { "op": "sweep", "var": "j", "values": [1], "steps": [
                { "op": "sweep", "var": "j", "values": [2], "steps": [ { "op": "zg" } ] }
            ] } ] }"#,
        )
        .unwrap();
        assert!(plan.validate().is_err());
    }

    #[test]
    fn substitution_keeps_types_for_exact_placeholders() {
        let mut b = Bindings::new();
        b.insert("gain".into(), ParamValue::Int(60));
        b.insert("gain_index".into(), ParamValue::Int(0));
        assert_eq!(
            substitute_value(&ParamValue::Text("{gain}".into()), &b),
            ParamValue::Int(60)
        );
        assert_eq!(
            substitute_value(&ParamValue::Text("{gain}dB".into()), &b),
            ParamValue::Text("60dB".into())
        );
        assert_eq!(substitute("RO_RecGain{gain}_{gain_index}", &b), "RO_RecGain60_0");
        assert_eq!(
            substitute_value(&ParamValue::Float(1.5), &b),
            ParamValue::Float(1.5)
        );
    }
}
