use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rainup_core::{Platform, ReleaseCatalog, ReleaseDescriptor};
use rainup_installer::{
    HttpDownloader, InstallOrchestrator, InstallSettings, InstallSnapshot, ProgressPoll,
    RunOutcome, UpdaterEnv,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::UpdaterConfig;
use crate::prompt::ask_conflict;
use crate::render::{render_status_line, OutputStyle, TerminalRenderer};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct InstallArgs {
    pub dir: PathBuf,
    pub catalog: PathBuf,
    pub to: String,
    pub from: Option<String>,
}

pub fn load_catalog(path: &Path) -> Result<ReleaseCatalog> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read release catalog {}", path.display()))?;
    ReleaseCatalog::from_toml_str(&raw)
        .with_context(|| format!("failed to parse release catalog {}", path.display()))
}

fn find_release(catalog: &ReleaseCatalog, version: &str, catalog_path: &Path) -> Result<ReleaseDescriptor> {
    catalog.find(version).cloned().ok_or_else(|| {
        anyhow!(
            "release '{version}' is not listed in {}",
            catalog_path.display()
        )
    })
}

fn current_platform() -> Result<Platform> {
    Platform::current().ok_or_else(|| {
        anyhow!(
            "no builds are published for {}",
            std::env::consts::OS
        )
    })
}

/// "install v1", "upgrade v1 -> v2", and so on.
pub fn describe_transition(from: Option<&ReleaseDescriptor>, to: &ReleaseDescriptor) -> String {
    let Some(from) = from else {
        return format!("install {}", to.version);
    };
    let verb = match (from.semver(), to.semver()) {
        (Ok(from_version), Ok(to_version)) => match from_version.cmp(&to_version) {
            Ordering::Less => "upgrade",
            Ordering::Greater => "downgrade",
            Ordering::Equal => "reinstall",
        },
        _ => "switch",
    };
    format!("{verb} {} -> {}", from.version, to.version)
}

pub fn run_install(config: &UpdaterConfig, args: InstallArgs) -> Result<()> {
    let catalog = load_catalog(&args.catalog)?;
    let target = find_release(&catalog, &args.to, &args.catalog)?;
    let current = args
        .from
        .as_deref()
        .map(|version| find_release(&catalog, version, &args.catalog))
        .transpose()?;
    let platform = current_platform()?;

    fs::create_dir_all(&args.dir)
        .with_context(|| format!("failed to create install dir {}", args.dir.display()))?;
    let install_dir = fs::canonicalize(&args.dir)
        .with_context(|| format!("failed to resolve install dir {}", args.dir.display()))?;

    let mut env = UpdaterEnv::new(&install_dir, platform);
    if let Some(executable) = std::env::current_exe()
        .ok()
        .and_then(|path| fs::canonicalize(path).ok())
    {
        env = env.with_self_executable(executable);
    }
    let settings = InstallSettings::new(env)
        .with_cache(config.cache_layout(&install_dir))
        .with_policy(config.policy());

    let renderer = TerminalRenderer::current();
    renderer.print_section(&describe_transition(current.as_ref(), &target));
    renderer.print_status(
        "step",
        &format!("cache {}", settings.cache.cache_dir().display()),
    );

    info!(
        "{} in {}",
        describe_transition(current.as_ref(), &target),
        install_dir.display()
    );
    let downloader = Arc::new(HttpDownloader::new().context("failed to build HTTP client")?);
    let mut orchestrator = InstallOrchestrator::start(settings, downloader, current, target)?;
    let mut progress = renderer.start_progress("update");

    loop {
        if let Some(request) = orchestrator.poll_conflict() {
            let outcome = progress.suspend(|| {
                let stdin = std::io::stdin();
                let mut stderr = std::io::stderr();
                ask_conflict(&request, &mut stdin.lock(), &mut stderr)
            })?;
            orchestrator.resolve_conflict(outcome)?;
            continue;
        }
        match orchestrator.poll_progress() {
            ProgressPoll::Done => break,
            ProgressPoll::Running { message, fraction } => progress.update(&message, fraction),
        }
        thread::sleep(POLL_INTERVAL);
    }

    let snapshot = orchestrator.wait();
    progress.finish();
    renderer.print_lines(&format_install_summary(&snapshot, renderer.style()));

    match snapshot.outcome {
        Some(RunOutcome::Completed) | Some(RunOutcome::Cancelled) => Ok(()),
        Some(RunOutcome::Faulted) | None => bail!(
            "{}",
            snapshot
                .fault
                .unwrap_or_else(|| "update ended without a result".to_string())
        ),
    }
}

pub fn format_install_summary(snapshot: &InstallSnapshot, style: OutputStyle) -> Vec<String> {
    let mut lines = Vec::new();
    match snapshot.outcome {
        Some(RunOutcome::Completed) => {
            lines.push(render_status_line(style, "ok", &snapshot.message));
            for path in &snapshot.kept_local {
                lines.push(render_status_line(
                    style,
                    "warn",
                    &format!("kept local changes to {path}"),
                ));
            }
        }
        Some(RunOutcome::Cancelled) => {
            lines.push(render_status_line(style, "warn", &snapshot.message));
        }
        Some(RunOutcome::Faulted) | None => {}
    }
    lines
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub version: String,
    pub beta: bool,
    pub platforms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog: Option<String>,
}

impl ReleaseSummary {
    pub fn from_release(release: &ReleaseDescriptor) -> Self {
        Self {
            version: release.version.clone(),
            beta: release.is_beta(),
            platforms: release
                .downloads
                .keys()
                .map(|platform| platform.as_str().to_string())
                .collect(),
            changelog: changelog_summary(release).map(str::to_string),
        }
    }
}

fn changelog_summary(release: &ReleaseDescriptor) -> Option<&str> {
    release
        .changelog
        .lines()
        .map(str::trim)
        .find(|text| !text.is_empty())
}

pub fn run_releases(catalog_path: &Path, include_betas: bool, json: bool) -> Result<()> {
    let catalog = load_catalog(catalog_path)?;
    let releases: Vec<&ReleaseDescriptor> = if include_betas {
        catalog.releases.iter().collect()
    } else {
        catalog.stable().collect()
    };
    if json {
        let summaries: Vec<ReleaseSummary> = releases
            .iter()
            .map(|release| ReleaseSummary::from_release(release))
            .collect();
        let rendered = serde_json::to_string_pretty(&summaries)
            .context("failed to serialize release listing")?;
        println!("{rendered}");
        return Ok(());
    }
    let lines = format_release_lines(&releases, Platform::current());
    if lines.is_empty() {
        println!("No releases listed in {}", catalog_path.display());
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

pub fn format_release_lines(
    releases: &[&ReleaseDescriptor],
    platform: Option<Platform>,
) -> Vec<String> {
    releases
        .iter()
        .map(|release| {
            let platforms = release
                .downloads
                .keys()
                .map(|available| available.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let mut line = format!("{:<12} {platforms}", release.version);
            if let Some(platform) = platform {
                if release.download_for(platform).is_none() {
                    line.push_str(&format!(" (no {platform} build)"));
                }
            }
            if let Some(summary) = changelog_summary(release) {
                line.push_str(&format!(" - {summary}"));
            }
            line
        })
        .collect()
}

pub fn run_cache(config: &UpdaterConfig, dir: &Path) -> Result<()> {
    let layout = config.cache_layout(dir);
    let archives = layout.cached_archives()?;
    println!("cache: {}", layout.cache_dir().display());
    if archives.is_empty() {
        println!("no cached archives");
    }
    for archive in archives {
        let size = fs::metadata(&archive)
            .with_context(|| format!("failed to stat {}", archive.display()))?
            .len();
        let name = archive
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let digest = sha256_file(&archive)?;
        println!("- {name} ({}) sha256:{digest}", indicatif::HumanBytes(size));
    }
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 8192];
    loop {
        let read = reader
            .read(&mut buffer)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
