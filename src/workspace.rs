//! Experiment directory bookkeeping.
//!
//! Creates the per-run directory, archives the driving plan next to the data
//! with version suffixes, and resolves experiment file names.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Extension of the vendor's experiment files.
pub const EXPERIMENT_EXT: &str = "tnt";

#[derive(Debug, Clone)]
pub struct ExperimentDir {
    pub root: PathBuf,
    pub path: PathBuf,
    /// False when an existing non-unique directory was reused.
    pub created: bool,
}

/// Resolve (and create) the experiment directory for this run.
///
/// With `unique` the first free `<name>_<N>` (N from 0) is created; otherwise
/// `<name>` is reused or created.
pub fn resolve_experiment_dir(root: &Path, name: &str, unique: bool) -> Result<ExperimentDir> {
    let name = name.trim_end_matches(['/', '\\']);
    anyhow::ensure!(!name.is_empty(), "experiment directory name is empty");
    let base = root.join(name);

    let (path, created) = if unique {
        let mut c = 0u32;
        let path = loop {
            let candidate = root.join(format!("{name}_{c}"));
            if !candidate.exists() {
                break candidate;
            }
            c += 1;
        };
        (path, true)
    } else if base.is_dir() {
        (base, false)
    } else {
        (base, true)
    };

    if created {
        std::fs::create_dir_all(&path)
            .with_context(|| format!("create experiment directory {}", path.display()))?;
    }

    Ok(ExperimentDir {
        root: root.to_path_buf(),
        path,
        created,
    })
}

/// Version suffix for a file in `dir`: `""` when `<stem>.<ext>` is free,
/// otherwise `-v<N>` for the smallest free `N >= 1`.
pub fn version_suffix(dir: &Path, stem: &str, ext: Option<&str>) -> String {
    let name = |suffix: &str| match ext {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    if !dir.join(name("")).exists() {
        return String::new();
    }
    let mut c = 1u32;
    loop {
        let suffix = format!("-v{c}");
        if !dir.join(name(&suffix)).exists() {
            return suffix;
        }
        c += 1;
    }
}

/// Copy the plan into the experiment directory without overwriting earlier
/// copies. Returns the archived path and the version suffix used.
pub fn archive_plan(exp_dir: &Path, plan: &Path) -> Result<(PathBuf, String)> {
    let stem = plan
        .file_stem()
        .and_then(|s| s.to_str())
        .context("plan path has no file name")?;
    let ext = plan.extension().and_then(|s| s.to_str());
    let suffix = version_suffix(exp_dir, stem, ext);
    let file_name = match ext {
        Some(ext) => format!("{stem}{suffix}.{ext}"),
        None => format!("{stem}{suffix}"),
    };
    let dest = exp_dir.join(file_name);
    std::fs::copy(plan, &dest)
        .with_context(|| format!("archive plan {} to {}", plan.display(), dest.display()))?;
    Ok((dest, suffix))
}

/// The higher of two `-vN` suffixes, `""` counting as zero.
pub fn later_suffix(a: String, b: String) -> String {
    let n = |s: &str| {
        s.strip_prefix("-v")
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0)
    };
    if n(&b) > n(&a) {
        b
    } else {
        a
    }
}

/// Whether two paths name the same file. Paths are compared as given and,
/// when both exist, after canonicalisation.
pub fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct LogPaths {
    pub run_log: PathBuf,
    pub data_log: PathBuf,
    pub summary: PathBuf,
}

pub fn log_paths(exp_dir: &Path, suffix: &str) -> LogPaths {
    LogPaths {
        run_log: exp_dir.join(format!("run_log{suffix}.txt")),
        data_log: exp_dir.join(format!("data_log{suffix}.txt")),
        summary: exp_dir.join(format!("run_summary{suffix}.json")),
    }
}

/// Resolve an experiment file name.
///
/// Adds the `.tnt` extension when missing. A bare name lands in the
/// experiment directory, a relative path with directories is taken from the
/// root, and absolute paths are kept.
pub fn resolve_file(root: &Path, exp_dir: &Path, name: &str) -> PathBuf {
    let mut file = OsString::from(name);
    let has_ext = Path::new(name)
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(EXPERIMENT_EXT));
    if !has_ext {
        file.push(".");
        file.push(EXPERIMENT_EXT);
    }
    let file = PathBuf::from(file);

    let bare = file.components().count() == 1
        && matches!(file.components().next(), Some(Component::Normal(_)));
    if bare {
        exp_dir.join(file)
    } else if file.is_absolute() {
        file
    } else {
        root.join(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_directories_count_from_zero() {
        let root = tempfile::tempdir().unwrap();
        let a = resolve_experiment_dir(root.path(), "data", true).unwrap();
        let b = resolve_experiment_dir(root.path(), "data/", true).unwrap();
        assert_eq!(a.path, root.path().join("data_0"));
        assert_eq!(b.path, root.path().join("data_1"));
        assert!(a.created && b.created);
        assert!(b.path.is_dir());
    }

    #[test]
    fn non_unique_directory_is_reused() {
        let root = tempfile::tempdir().unwrap();
        let a = resolve_experiment_dir(root.path(), "data", false).unwrap();
        assert!(a.created);
        let b = resolve_experiment_dir(root.path(), "data", false).unwrap();
        assert!(!b.created);
        assert_eq!(a.path, b.path);
    }

    #[test]
    fn empty_directory_name_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        assert!(resolve_experiment_dir(root.path(), "/", true).is_err());
    }

    #[test]
    fn archived_plans_get_version_suffixes() {
        let root = tempfile::tempdir().unwrap();
        let plan = root.path().join("sweep.json");
        std::fs::write(&plan, "{}").unwrap();
        let exp = resolve_experiment_dir(root.path(), "data", false).unwrap();

        let (p0, s0) = archive_plan(&exp.path, &plan).unwrap();
        let (p1, s1) = archive_plan(&exp.path, &plan).unwrap();
        let (p2, s2) = archive_plan(&exp.path, &plan).unwrap();
        assert_eq!((s0.as_str(), s1.as_str(), s2.as_str()), ("", "-v1", "-v2"));
        assert_eq!(p0, exp.path.join("sweep.json"));
        assert_eq!(p1, exp.path.join("sweep-v1.json"));
        assert_eq!(p2, exp.path.join("sweep-v2.json"));

        let logs = log_paths(&exp.path, &s2);
        assert_eq!(logs.run_log, exp.path.join("run_log-v2.txt"));
        assert_eq!(logs.data_log, exp.path.join("data_log-v2.txt"));
    }

    #[test]
    fn later_suffix_compares_versions() {
        assert_eq!(later_suffix(String::new(), "-v1".into()), "-v1");
        assert_eq!(later_suffix("-v10".into(), "-v2".into()), "-v10");
        assert_eq!(later_suffix(String::new(), String::new()), "");
    }

    #[test]
    fn same_file_sees_through_dot_dot() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("templates")).unwrap();
        let file = root.path().join("RO.tnt");
        std::fs::write(&file, "{}").unwrap();
        assert!(same_file(&file, &root.path().join("templates/../RO.tnt")));
        assert!(!same_file(&file, &root.path().join("FID.tnt")));
    }

    #[test]
    fn file_names_resolve_by_shape() {
        let root = Path::new("/lab");
        let exp = Path::new("/lab/data_0");
        assert_eq!(
            resolve_file(root, exp, "RO_RecGain60"),
            PathBuf::from("/lab/data_0/RO_RecGain60.tnt")
        );
        assert_eq!(
            resolve_file(root, exp, "FID.TNT"),
            PathBuf::from("/lab/data_0/FID.TNT")
        );
        assert_eq!(
            resolve_file(root, exp, "templates/CPMG"),
            PathBuf::from("/lab/templates/CPMG.tnt")
        );
        assert_eq!(
            resolve_file(root, exp, "/abs/FID.tnt"),
            PathBuf::from("/abs/FID.tnt")
        );
        // A dotted sweep value is not mistaken for an extension.
        assert_eq!(
            resolve_file(root, exp, "FID_2.25"),
            PathBuf::from("/lab/data_0/FID_2.25.tnt")
        );
    }
}
