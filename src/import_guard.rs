//! Double-import denial for script modules.
//!
//! Experiment scripts assemble their library from `import` statements, and
//! a search-path mistake can load the same source file under two different
//! logical names. The two copies then hold independent state, which in a
//! lab suite means duplicated device registries and silently diverging
//! calibration constants. The guard refuses the second import instead.
//!
//! `ImportGuard` is a [`rhai::ModuleResolver`] wrapped around the standard
//! [`FileModuleResolver`]. Before delegating it canonicalizes the origin of
//! the requested module (symlinks resolved, case folded on
//! case-insensitive filesystems; a package directory stands for itself
//! rather than its `mod.rhai`) and checks the process-wide import record.
//! A hit under a different logical name fails resolution with a
//! [`DoubleImportError`] naming the canonical path, both names and both
//! abbreviated load sites; the module is never cached, so the engine's
//! loaded-modules table stays clean.
//!
//! Installation is idempotent by refusal: the process-wide installed flag
//! makes a second [`ImportGuard::install`] an error, so two guard instances
//! can never sit in the resolver chain.

use rhai::module_resolvers::FileModuleResolver;
use rhai::{Engine, EvalAltResult, Module, ModuleResolver, Position, Shared};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::error::{CoordError, CoordResult};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Top-level module names whose layout legitimately imports itself under
/// more than one name.
pub const DEFAULT_WHITELIST: &[&str] = &["prelude"];

/// Where and how a module was first loaded.
#[derive(Debug, Clone)]
pub struct ImportRecord {
    /// Logical name used in the import statement.
    pub name: String,
    /// Abbreviated capture of the first load site.
    pub site: String,
}

/// The same canonical file was imported under two logical names.
#[derive(Debug, Clone, Error)]
#[error(
    "module file {canonical_path} already imported as '{first_name}', \
     refusing second import as '{second_name}'\n\
     first import:\n{first_site}\n\
     second import:\n{second_site}"
)]
pub struct DoubleImportError {
    pub canonical_path: String,
    pub first_name: String,
    pub second_name: String,
    pub first_site: String,
    pub second_site: String,
}

/// Options for [`ImportGuard::install`].
#[derive(Debug, Clone)]
pub struct GuardOptions {
    /// Base directory module paths are resolved against.
    pub base_path: PathBuf,
    /// Exempt top-level module names.
    pub whitelist: Vec<String>,
    /// When false, installation is skipped entirely.
    pub enabled: bool,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("."),
            whitelist: DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect(),
            enabled: true,
        }
    }
}

/// Module resolver that denies double imports.
pub struct ImportGuard {
    inner: FileModuleResolver,
    base_path: PathBuf,
    whitelist: HashSet<String>,
    records: Mutex<HashMap<PathBuf, ImportRecord>>,
    in_flight: Mutex<HashSet<String>>,
}

impl ImportGuard {
    /// Build a guard without installing it. Useful for tests and for
    /// embedding in custom engines.
    pub fn new(options: &GuardOptions) -> Self {
        Self {
            inner: FileModuleResolver::new_with_path(&options.base_path),
            base_path: options.base_path.clone(),
            whitelist: options.whitelist.iter().cloned().collect(),
            records: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Install the guard as the engine's module resolver.
    ///
    /// Installing a second guard in the same process is an error; with
    /// `options.enabled == false` nothing is installed at all.
    pub fn install(engine: &mut Engine, options: GuardOptions) -> CoordResult<()> {
        if !options.enabled {
            debug!("import guard disabled, scripts may double-import");
            return Ok(());
        }
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(CoordError::GuardAlreadyInstalled);
        }
        engine.set_module_resolver(Self::new(&options));
        Ok(())
    }

    /// Number of recorded imports. For tests and diagnostics.
    pub fn recorded(&self) -> usize {
        lock(&self.records).len()
    }

    /// Whether a canonical path is on record.
    pub fn is_recorded(&self, canonical: &Path) -> bool {
        lock(&self.records).contains_key(canonical)
    }

    /// Canonical on-disk identity of an import path, if it exists, plus the
    /// path to hand to the inner resolver.
    ///
    /// A directory containing `mod.rhai` is a package and stands for
    /// itself, whether imported as the directory or as its mod script;
    /// otherwise the identity is the symlink-resolved script file.
    fn canonical_origin(&self, path: &str) -> Option<(PathBuf, String)> {
        let joined = self.base_path.join(path);
        if joined.is_dir() && joined.join("mod.rhai").is_file() {
            let canonical = std::fs::canonicalize(&joined).ok()?;
            return Some((fold_case(canonical), format!("{path}/mod")));
        }
        let file = joined.with_extension("rhai");
        let canonical = std::fs::canonicalize(&file).ok()?;
        let identity = if canonical.file_name().is_some_and(|n| n == "mod.rhai") {
            canonical.parent()?.to_path_buf()
        } else {
            canonical
        };
        Some((fold_case(identity), path.to_string()))
    }

    fn top_level_name(path: &str) -> &str {
        path.split('/').next().unwrap_or(path)
    }
}

impl ModuleResolver for ImportGuard {
    fn resolve(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        // Re-entered for a query already being resolved: short-circuit to
        // the inner resolver so the guard never loops through itself.
        if !lock(&self.in_flight).insert(path.to_string()) {
            return self.inner.resolve(engine, source, path, pos);
        }
        let result = self.resolve_guarded(engine, source, path, pos);
        lock(&self.in_flight).remove(path);
        result
    }
}

impl ImportGuard {
    fn resolve_guarded(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        let Some((canonical, load_path)) = self.canonical_origin(path) else {
            // Nothing on disk; let the standard resolver produce its
            // not-found error.
            return self.inner.resolve(engine, source, path, pos);
        };

        let whitelisted = self.whitelist.contains(Self::top_level_name(path));
        if !whitelisted {
            let records = lock(&self.records);
            if let Some(first) = records.get(&canonical) {
                if first.name != path {
                    let err = DoubleImportError {
                        canonical_path: canonical.to_string_lossy().into_owned(),
                        first_name: first.name.clone(),
                        second_name: path.to_string(),
                        first_site: first.site.clone(),
                        second_site: capture_site(source, pos),
                    };
                    return Err(Box::new(EvalAltResult::ErrorSystem(
                        "double import denied".to_string(),
                        Box::new(err),
                    )));
                }
            }
        }

        // Packages load through their mod script but are recorded by
        // directory.
        let module = self.inner.resolve(engine, source, &load_path, pos)?;

        lock(&self.records)
            .entry(canonical)
            .or_insert_with(|| ImportRecord {
                name: path.to_string(),
                site: capture_site(source, pos),
            });
        Ok(module)
    }
}

/// Abbreviated capture of an import site: the requesting script position
/// plus a backtrace with the script-machinery frames filtered out.
fn capture_site(source: Option<&str>, pos: Position) -> String {
    let origin = source.unwrap_or("<script>");
    let mut out = format!("  {origin} @ {pos}");
    for frame in abbreviated_backtrace() {
        out.push('\n');
        out.push_str("  ");
        out.push_str(&frame);
    }
    out
}

fn abbreviated_backtrace() -> Vec<String> {
    const MACHINERY: &[&str] = &[
        "rhai::",
        "backtrace::",
        "std::backtrace",
        "import_guard::capture_site",
        "import_guard::abbreviated_backtrace",
        "std::panicking",
        "__rust",
    ];
    const MAX_FRAMES: usize = 8;

    let raw = std::backtrace::Backtrace::force_capture().to_string();
    let mut frames: Vec<String> = Vec::new();
    let mut keep_location = false;
    for line in raw.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("at ") {
            if keep_location {
                if let Some(frame) = frames.last_mut() {
                    frame.push_str(" (");
                    frame.push_str(trimmed);
                    frame.push(')');
                }
                keep_location = false;
            }
            continue;
        }
        let symbol = trimmed.split_once(": ").map_or("", |(_, s)| s);
        if !symbol.is_empty()
            && !MACHINERY.iter().any(|m| symbol.contains(m))
            && frames.len() < MAX_FRAMES
        {
            frames.push(symbol.to_string());
            keep_location = true;
        } else {
            keep_location = false;
        }
    }
    frames
}

fn fold_case(path: PathBuf) -> PathBuf {
    if cfg!(any(windows, target_os = "macos")) {
        PathBuf::from(path.to_string_lossy().to_lowercase())
    } else {
        path
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
pub(crate) fn reset_installed_for_tests() {
    INSTALLED.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn guard_for(dir: &Path) -> ImportGuard {
        ImportGuard::new(&GuardOptions {
            base_path: dir.to_path_buf(),
            ..GuardOptions::default()
        })
    }

    fn engine_with_guard(dir: &Path) -> Engine {
        let mut engine = Engine::new();
        engine.set_module_resolver(guard_for(dir));
        engine
    }

    #[test]
    fn test_distinct_modules_both_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alpha.rhai"), "export const VALUE = 1;").unwrap();
        fs::write(dir.path().join("beta.rhai"), "export const VALUE = 2;").unwrap();

        let engine = engine_with_guard(dir.path());
        let total: i64 = engine
            .eval(r#"import "alpha" as a; import "beta" as b; a::VALUE + b::VALUE"#)
            .unwrap();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_same_name_reimport_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alpha.rhai"), "export const VALUE = 1;").unwrap();

        let engine = engine_with_guard(dir.path());
        let value: i64 = engine
            .eval(r#"import "alpha" as a; import "alpha" as b; a::VALUE + b::VALUE"#)
            .unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_same_file_under_second_name_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("alpha.rhai"), "export const VALUE = 1;").unwrap();

        let engine = engine_with_guard(dir.path());
        let first: i64 = engine.eval(r#"import "alpha" as a; a::VALUE"#).unwrap();
        assert_eq!(first, 1);

        // Same file reached through a different logical path.
        let err = engine
            .eval::<i64>(r#"import "sub/../alpha" as a; a::VALUE"#)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("double import"), "got: {message}");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_module_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alpha.rhai"), "export const VALUE = 1;").unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("alpha.rhai"),
            dir.path().join("alias.rhai"),
        )
        .unwrap();

        let engine = engine_with_guard(dir.path());
        engine
            .eval::<i64>(r#"import "alpha" as a; a::VALUE"#)
            .unwrap();
        let err = engine
            .eval::<i64>(r#"import "alias" as a; a::VALUE"#)
            .unwrap_err();
        assert!(err.to_string().contains("double import"));
    }

    #[test]
    fn test_denied_module_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("alpha.rhai"), "export const VALUE = 1;").unwrap();

        let guard = guard_for(dir.path());
        let engine = Engine::new();
        guard
            .resolve(&engine, None, "alpha", Position::NONE)
            .unwrap();
        assert_eq!(guard.recorded(), 1);

        let denied = guard.resolve(&engine, None, "./alpha", Position::NONE);
        assert!(denied.is_err());
        // Exactly one record; the denied name never entered the table.
        assert_eq!(guard.recorded(), 1);
    }

    #[test]
    fn test_whitelisted_top_level_is_exempt() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("prelude")).unwrap();
        fs::write(
            dir.path().join("prelude").join("units.rhai"),
            "export const MM = 1;",
        )
        .unwrap();

        let guard = guard_for(dir.path());
        let engine = Engine::new();
        guard
            .resolve(&engine, None, "prelude/units", Position::NONE)
            .unwrap();
        // Second name for the same file, but under the whitelisted package.
        let again = guard.resolve(&engine, None, "prelude/../prelude/units", Position::NONE);
        assert!(again.is_ok());
    }

    #[test]
    fn test_package_directory_is_the_identity() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg").join("mod.rhai"), "export const V = 7;").unwrap();

        let guard = guard_for(dir.path());
        let engine = Engine::new();
        guard.resolve(&engine, None, "pkg", Position::NONE).unwrap();

        let canonical = std::fs::canonicalize(dir.path().join("pkg")).unwrap();
        assert!(guard.is_recorded(&canonical));

        // The same package via its mod script is a different logical name
        // for the same directory identity.
        let denied = guard.resolve(&engine, None, "pkg/mod", Position::NONE);
        assert!(denied.is_err());
    }

    #[test]
    fn test_missing_module_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_guard(dir.path());
        let err = engine.eval::<i64>(r#"import "ghost" as g; 1"#).unwrap_err();
        assert!(!err.to_string().contains("double import"));
    }

    #[test]
    #[serial]
    fn test_double_install_is_an_error() {
        reset_installed_for_tests();
        let mut engine = Engine::new();
        ImportGuard::install(&mut engine, GuardOptions::default()).unwrap();
        let second = ImportGuard::install(&mut engine, GuardOptions::default());
        assert!(matches!(second, Err(CoordError::GuardAlreadyInstalled)));
        reset_installed_for_tests();
    }

    #[test]
    #[serial]
    fn test_disabled_install_is_a_noop() {
        reset_installed_for_tests();
        let mut engine = Engine::new();
        let options = GuardOptions {
            enabled: false,
            ..GuardOptions::default()
        };
        ImportGuard::install(&mut engine, options).unwrap();
        // Not installed, so a real install afterwards still succeeds.
        ImportGuard::install(&mut engine, GuardOptions::default()).unwrap();
        reset_installed_for_tests();
    }

    #[test]
    fn test_capture_site_names_origin() {
        let site = capture_site(Some("scan_control"), Position::new(12, 1));
        assert!(site.contains("scan_control"));
    }
}
