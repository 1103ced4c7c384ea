use crate::config::{LoggingConfig, Section};
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// Keep a guard for non-blocking console to avoid being dropped.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

const DEFAULT_MAX_SIZE_MB: u64 = 100;

// ================= level helpers =================

/// Parse a configured level. Empty means "not configured"; unknown strings fall back to INFO.
fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" => None,
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" | "none" => Some(LevelFilter::OFF),
        _ => Some(LevelFilter::INFO),
    }
}

/// Returns true if target == prefix or target starts with "prefix::"
fn matches_target_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ================= rotating file writers =================

type SharedRotate = Arc<Mutex<FileRotate<AppendTimestamp>>>;

#[derive(Clone)]
struct FileHandle(Option<SharedRotate>);

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(file) => file.lock().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(file) => file.lock().flush(),
            None => Ok(()),
        }
    }
}

/// Routes records to files by target prefix; the longest matching prefix wins.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<SharedRotate>,
    by_prefix: Vec<(String, SharedRotate)>,
}

impl FileRouter {
    fn build(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let mut router = FileRouter::default();
        for (name, section) in cfg {
            let Some(writer) = open_section_file(name, section, base_dir) else {
                continue;
            };
            if name == "default" {
                router.default = Some(writer);
            } else {
                router.by_prefix.push((name.clone(), writer));
            }
        }
        router
            .by_prefix
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        router
    }

    fn resolve_for(&self, target: &str) -> Option<SharedRotate> {
        self.by_prefix
            .iter()
            .find(|(prefix, _)| matches_target_prefix(target, prefix))
            .map(|(_, w)| w.clone())
            .or_else(|| self.default.clone())
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = FileHandle;

    fn make_writer(&'a self) -> Self::Writer {
        FileHandle(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        FileHandle(self.resolve_for(meta.target()))
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn open_section_file(name: &str, section: &Section, base_dir: &Path) -> Option<SharedRotate> {
    if section.file.trim().is_empty() {
        return None;
    }
    let path = resolve_log_path(&section.file, base_dir);
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!(
                "Failed to init log file for '{name}': {} ({e})",
                path.display()
            );
            return None;
        }
    }

    // Prefer MaxFiles if provided, else Age
    let limit = match section.max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(
            i64::from(section.max_age_days.unwrap_or(1)),
        )),
    };
    let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;

    let rot = FileRotate::new(
        &path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    );
    Some(Arc::new(Mutex::new(rot)))
}

// ================= per-sink targets =================

enum Sink {
    Console,
    File { has_default_file: bool },
}

fn build_targets(cfg: &LoggingConfig, sink: Sink) -> Targets {
    let default_section = cfg.get("default");
    let level_of = |s: &Section| match sink {
        Sink::Console => parse_level(&s.console_level),
        Sink::File { .. } => parse_level(&s.file_level),
    };

    let fallback = match sink {
        Sink::Console => LevelFilter::INFO,
        Sink::File { has_default_file: true } => LevelFilter::INFO,
        Sink::File { has_default_file: false } => LevelFilter::OFF,
    };
    let mut targets =
        Targets::new().with_default(default_section.and_then(level_of).unwrap_or(fallback));

    for (name, section) in cfg.iter().filter(|(k, _)| k.as_str() != "default") {
        // file rules only apply where the subsystem actually has a file
        if matches!(sink, Sink::File { .. }) && section.file.trim().is_empty() {
            continue;
        }
        if let Some(level) = level_of(section) {
            targets = targets.with_target(name.clone(), level);
        }
    }
    targets
}

// ================= public init =================

/// Install the global subscriber: console (stderr, non-blocking) plus optional
/// JSON rotating files. `RUST_LOG`, when set, caps both sinks.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` *before* installing the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    let env = EnvFilter::try_from_default_env().ok();

    if cfg.is_empty() {
        let console = fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339());
        let _ = tracing_subscriber::registry().with(env).with(console).try_init();
        return;
    }

    let router = FileRouter::build(cfg, base_dir);
    let console_targets = build_targets(cfg, Sink::Console);
    let file_targets = build_targets(
        cfg,
        Sink::File {
            has_default_file: router.default.is_some(),
        },
    );

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console = fmt::layer()
        .with_writer(nb_stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console_targets);

    let files = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_current_span(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(file_targets)
    });

    let _ = tracing_subscriber::registry()
        .with(env)
        .with(console)
        .with(files)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing::Level;

    fn section(console: &str, file: &str, file_level: &str) -> Section {
        Section {
            console_level: console.to_string(),
            file: file.to_string(),
            file_level: file_level.to_string(),
            max_age_days: None,
            max_backups: Some(2),
            max_size_mb: Some(1),
        }
    }

    #[test]
    fn level_parsing() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("off"), Some(LevelFilter::OFF));
        assert_eq!(parse_level(""), None);
        assert_eq!(parse_level("loud"), Some(LevelFilter::INFO));
    }

    #[test]
    fn prefix_matching_respects_module_boundaries() {
        assert!(matches_target_prefix("wirekit", "wirekit"));
        assert!(matches_target_prefix("wirekit::runtime", "wirekit"));
        assert!(!matches_target_prefix("wirekit_bootstrap", "wirekit"));
        assert!(!matches_target_prefix("wire", "wirekit"));
    }

    #[test]
    fn console_targets_apply_per_subsystem_levels() {
        let mut cfg = LoggingConfig::new();
        cfg.insert("default".into(), section("warn", "", ""));
        cfg.insert("wirekit::runtime".into(), section("debug", "", ""));

        let targets = build_targets(&cfg, Sink::Console);
        assert!(targets.would_enable("wirekit::runtime::host_runtime", &Level::DEBUG));
        assert!(!targets.would_enable("wirekit::container", &Level::INFO));
        assert!(targets.would_enable("other", &Level::WARN));
    }

    #[test]
    fn file_targets_skip_subsystems_without_files() {
        let mut cfg = LoggingConfig::new();
        cfg.insert("noisy".into(), section("info", "", "trace"));
        cfg.insert("audit".into(), section("info", "audit.log", "debug"));

        let targets = build_targets(
            &cfg,
            Sink::File {
                has_default_file: false,
            },
        );
        assert!(targets.would_enable("audit", &Level::DEBUG));
        assert!(!targets.would_enable("noisy", &Level::ERROR));
    }

    #[test]
    fn router_prefers_longest_prefix_and_writes_files() {
        let tmp = tempdir().unwrap();
        let mut cfg = LoggingConfig::new();
        cfg.insert("default".into(), section("info", "logs/all.log", "info"));
        cfg.insert("wirekit".into(), section("info", "logs/core.log", "info"));
        cfg.insert(
            "wirekit::runtime".into(),
            section("info", "logs/runtime.log", "info"),
        );

        let router = FileRouter::build(&cfg, tmp.path());
        assert!(!router.is_empty());

        let runtime = router.resolve_for("wirekit::runtime::runner").unwrap();
        let by_prefix = &router.by_prefix[0];
        assert_eq!(by_prefix.0, "wirekit::runtime");
        assert!(Arc::ptr_eq(&runtime, &by_prefix.1));

        let fallback = router.resolve_for("app").unwrap();
        assert!(Arc::ptr_eq(&fallback, router.default.as_ref().unwrap()));

        let mut handle = FileHandle(Some(runtime));
        handle.write_all(b"{\"msg\":\"hello\"}\n").unwrap();
        handle.flush().unwrap();
        let written = std::fs::read_to_string(tmp.path().join("logs/runtime.log")).unwrap();
        assert!(written.contains("hello"));
    }

    #[test]
    fn empty_file_disables_sink() {
        let tmp = tempdir().unwrap();
        let mut cfg = LoggingConfig::new();
        cfg.insert("default".into(), section("info", "  ", "info"));
        assert!(FileRouter::build(&cfg, tmp.path()).is_empty());
    }
}
