use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rainup_core::{Platform, ReleaseDescriptor};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use super::*;

const OLD_URL: &str = "https://releases.test/v1.0.0/rained-windows.zip";
const NEW_URL: &str = "https://releases.test/v1.1.0/rained-windows.zip";
const OLD_TGZ_URL: &str = "https://releases.test/v1.0.0/rained-linux.tar.gz";
const NEW_TGZ_URL: &str = "https://releases.test/v1.1.0/rained-linux.tar.gz";

fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, data) in files {
        writer.start_file(*name, options).expect("must start zip member");
        writer
            .write_all(data.as_bytes())
            .expect("must write zip member");
    }
    writer.finish().expect("must finish zip").into_inner()
}

fn tar_gz_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, name, data.as_bytes())
            .expect("must append tar member");
    }
    let tar = builder.into_inner().expect("must finish tar");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).expect("must compress tar");
    encoder.finish().expect("must finish gzip")
}

fn release(version: &str, url: &str) -> ReleaseDescriptor {
    ReleaseDescriptor::new(version).with_download(Platform::Windows, url)
}

fn linux_release(version: &str, url: &str) -> ReleaseDescriptor {
    ReleaseDescriptor::new(version).with_download(Platform::Linux, url)
}

#[derive(Default)]
struct MemoryDownloader {
    payloads: HashMap<String, Vec<u8>>,
    requests: Mutex<Vec<String>>,
}

impl MemoryDownloader {
    fn with(mut self, url: &str, payload: Vec<u8>) -> Self {
        self.payloads.insert(url.to_string(), payload);
        self
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Downloader for MemoryDownloader {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut dyn FnMut(u64, Option<u64>) -> bool,
    ) -> Result<FetchStatus, FetchError> {
        self.requests.lock().push(url.to_string());
        let Some(payload) = self.payloads.get(url) else {
            return Err(FetchError::Transfer {
                url: url.to_string(),
                status: 404,
            });
        };

        let io_err = |source: io::Error| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        };
        let mut file = File::create(dest).map_err(io_err)?;
        let total = payload.len() as u64;
        let mut done = 0;
        for chunk in payload.chunks(64) {
            file.write_all(chunk).map_err(io_err)?;
            done += chunk.len() as u64;
            if !on_progress(done, Some(total)) {
                return Ok(FetchStatus::Aborted);
            }
        }
        Ok(FetchStatus::Completed)
    }
}

/// Writes a few bytes, then reports progress until told to stop.
#[derive(Default)]
struct StallingDownloader {
    started: AtomicBool,
}

impl Downloader for StallingDownloader {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &mut dyn FnMut(u64, Option<u64>) -> bool,
    ) -> Result<FetchStatus, FetchError> {
        let mut file = File::create(dest).map_err(|source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        file.write_all(b"partial").map_err(|source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        self.started.store(true, Ordering::SeqCst);

        for _ in 0..10_000 {
            if !on_progress(7, Some(1_000)) {
                return Ok(FetchStatus::Aborted);
            }
            thread::sleep(Duration::from_millis(1));
        }
        Err(FetchError::Transfer {
            url: url.to_string(),
            status: 408,
        })
    }
}

struct Fixture {
    _root: TempDir,
    install_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().expect("must create temp dir");
        let install_dir = root.path().join("install");
        let cache_dir = root.path().join("cache");
        fs::create_dir_all(&install_dir).expect("must create install dir");
        Self {
            _root: root,
            install_dir,
            cache_dir,
        }
    }

    fn settings(&self, platform: Platform) -> InstallSettings {
        InstallSettings::new(UpdaterEnv::new(&self.install_dir, platform))
            .with_cache(CacheLayout::new(&self.cache_dir))
    }

    fn live(&self, rel: &str) -> PathBuf {
        self.install_dir.join(rel)
    }

    fn write_live(&self, rel: &str, content: &str) {
        let path = self.live(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("must create live parent");
        }
        fs::write(path, content).expect("must write live file");
    }

    fn read_live(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.live(rel)).ok()
    }
}

/// Polls `orchestrator` to completion, answering each conflict with `decide`.
/// Returns the final snapshot and the conflict paths in the order raised.
fn drive(
    orchestrator: &mut InstallOrchestrator,
    mut decide: impl FnMut(&ConflictRequest) -> ConflictOutcome,
) -> (InstallSnapshot, Vec<String>) {
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut asked = Vec::new();
    loop {
        if let Some(request) = orchestrator.poll_conflict() {
            asked.push(request.path().to_string());
            orchestrator
                .resolve_conflict(decide(&request))
                .expect("outstanding conflict must resolve");
        }
        if orchestrator.poll_progress() == ProgressPoll::Done {
            break;
        }
        assert!(Instant::now() < deadline, "install run did not finish");
        thread::sleep(Duration::from_millis(2));
    }
    (orchestrator.wait(), asked)
}

fn wait_for_conflict(orchestrator: &InstallOrchestrator) -> ConflictRequest {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if let Some(request) = orchestrator.poll_conflict() {
            return request;
        }
        assert!(
            orchestrator.outcome().is_none(),
            "run finished without raising a conflict"
        );
        assert!(Instant::now() < deadline, "no conflict was raised");
        thread::sleep(Duration::from_millis(2));
    }
}

fn no_conflicts(request: &ConflictRequest) -> ConflictOutcome {
    panic!("unexpected conflict for {}", request.path());
}

fn start_update(fixture: &Fixture, downloader: Arc<MemoryDownloader>) -> InstallOrchestrator {
    InstallOrchestrator::start(
        fixture.settings(Platform::Windows),
        downloader,
        Some(release("v1.0.0", OLD_URL)),
        release("v1.1.0", NEW_URL),
    )
    .expect("orchestrator must start")
}

fn archives(old: &[(&str, &str)], new: &[(&str, &str)]) -> Arc<MemoryDownloader> {
    Arc::new(
        MemoryDownloader::default()
            .with(OLD_URL, zip_bytes(old))
            .with(NEW_URL, zip_bytes(new)),
    )
}

#[test]
fn fresh_install_extracts_every_entry() {
    let fixture = Fixture::new();
    let downloader = Arc::new(MemoryDownloader::default().with(
        NEW_URL,
        zip_bytes(&[
            ("Rained.exe", "binary"),
            ("config/preferences.json", "{}"),
            ("assets/tiles/init.txt", "tiles"),
        ]),
    ));

    let mut orchestrator = InstallOrchestrator::start(
        fixture.settings(Platform::Windows),
        downloader.clone(),
        None,
        release("v1.1.0", NEW_URL),
    )
    .expect("orchestrator must start");
    let (snapshot, asked) = drive(&mut orchestrator, no_conflicts);

    assert!(asked.is_empty());
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(snapshot.phase, InstallPhase::Finished);
    assert_eq!(snapshot.fraction, Some(1.0));
    assert!(snapshot.done);
    assert_eq!(snapshot.fault, None);
    assert_eq!(orchestrator.poll_fault(), None);
    assert_eq!(fixture.read_live("Rained.exe").as_deref(), Some("binary"));
    assert_eq!(
        fixture.read_live("config/preferences.json").as_deref(),
        Some("{}")
    );
    assert_eq!(
        fixture.read_live("assets/tiles/init.txt").as_deref(),
        Some("tiles")
    );
    assert_eq!(downloader.requests(), vec![NEW_URL.to_string()]);
    assert!(fixture.cache_dir.join("v1.1.0-windows.zip").is_file());
}

#[test]
fn unchanged_file_is_replaced_without_conflict() {
    let fixture = Fixture::new();
    fixture.write_live("F.txt", "A");
    let downloader = archives(&[("F.txt", "A")], &[("F.txt", "A-new")]);

    let mut orchestrator = start_update(&fixture, downloader.clone());
    let (snapshot, asked) = drive(&mut orchestrator, no_conflicts);

    assert!(asked.is_empty());
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(fixture.read_live("F.txt").as_deref(), Some("A-new"));
    assert_eq!(
        downloader.requests(),
        vec![OLD_URL.to_string(), NEW_URL.to_string()]
    );
}

#[test]
fn modified_file_kept_local_survives_update() {
    let fixture = Fixture::new();
    fixture.write_live("F.txt", "B");
    let downloader = archives(&[("F.txt", "A")], &[("F.txt", "A-new")]);

    let mut orchestrator = start_update(&fixture, downloader);
    let (snapshot, asked) = drive(&mut orchestrator, |_| ConflictOutcome::KeepLocal);

    assert_eq!(asked, vec!["F.txt".to_string()]);
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(snapshot.kept_local, vec!["F.txt".to_string()]);
    assert_eq!(fixture.read_live("F.txt").as_deref(), Some("B"));
}

#[test]
fn modified_file_overwritten_takes_new_content() {
    let fixture = Fixture::new();
    fixture.write_live("F.txt", "B");
    let downloader = archives(&[("F.txt", "A")], &[("F.txt", "A-new")]);

    let mut orchestrator = start_update(&fixture, downloader);
    let (snapshot, asked) = drive(&mut orchestrator, |_| ConflictOutcome::Overwrite);

    assert_eq!(asked, vec!["F.txt".to_string()]);
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert!(snapshot.kept_local.is_empty());
    assert_eq!(fixture.read_live("F.txt").as_deref(), Some("A-new"));
}

#[cfg(unix)]
fn link_live_to_outside(fixture: &Fixture, rel: &str) -> PathBuf {
    let outside = fixture
        .install_dir
        .parent()
        .expect("install dir must have a parent")
        .join("outside.json");
    fs::write(&outside, "user edits").expect("must write outside file");
    let link = fixture.live(rel);
    fs::create_dir_all(link.parent().expect("link must have a parent"))
        .expect("must create link parent");
    std::os::unix::fs::symlink(&outside, &link).expect("must create symlink");
    outside
}

#[cfg(unix)]
#[test]
fn symlinked_live_file_kept_local_leaves_link_and_target_alone() {
    let fixture = Fixture::new();
    let outside = link_live_to_outside(&fixture, "config/theme.json");
    let downloader = archives(
        &[("config/theme.json", "theme v1")],
        &[("config/theme.json", "theme v2")],
    );

    let mut orchestrator = start_update(&fixture, downloader);
    let (snapshot, asked) = drive(&mut orchestrator, |_| ConflictOutcome::KeepLocal);

    assert_eq!(asked, vec!["config/theme.json".to_string()]);
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(snapshot.kept_local, vec!["config/theme.json".to_string()]);
    assert_eq!(
        fs::read_to_string(&outside).expect("must read outside file"),
        "user edits"
    );
    let meta = fs::symlink_metadata(fixture.live("config/theme.json"))
        .expect("link must still exist");
    assert!(meta.file_type().is_symlink());
}

#[cfg(unix)]
#[test]
fn symlinked_live_file_overwritten_is_replaced_not_followed() {
    let fixture = Fixture::new();
    let outside = link_live_to_outside(&fixture, "config/theme.json");
    let downloader = archives(
        &[("config/theme.json", "theme v1")],
        &[("config/theme.json", "theme v2")],
    );

    let mut orchestrator = start_update(&fixture, downloader);
    let (snapshot, asked) = drive(&mut orchestrator, |_| ConflictOutcome::Overwrite);

    assert_eq!(asked, vec!["config/theme.json".to_string()]);
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(
        fs::read_to_string(&outside).expect("must read outside file"),
        "user edits"
    );
    let meta = fs::symlink_metadata(fixture.live("config/theme.json"))
        .expect("new file must exist");
    assert!(meta.file_type().is_file());
    assert_eq!(
        fixture.read_live("config/theme.json").as_deref(),
        Some("theme v2")
    );
}

#[cfg(unix)]
#[test]
fn symlink_under_unchecked_prefix_still_raises_a_conflict() {
    let fixture = Fixture::new();
    let outside = link_live_to_outside(&fixture, "assets/shader.glsl");
    let downloader = archives(
        &[("assets/shader.glsl", "shader v1")],
        &[("assets/shader.glsl", "shader v2")],
    );

    let mut orchestrator = start_update(&fixture, downloader);
    let (snapshot, asked) = drive(&mut orchestrator, |_| ConflictOutcome::Overwrite);

    assert_eq!(asked, vec!["assets/shader.glsl".to_string()]);
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(
        fs::read_to_string(&outside).expect("must read outside file"),
        "user edits"
    );
    assert_eq!(
        fixture.read_live("assets/shader.glsl").as_deref(),
        Some("shader v2")
    );
}

#[test]
fn conflict_cancel_ends_run_cleanly() {
    let fixture = Fixture::new();
    fixture.write_live("F.txt", "B");
    let downloader = archives(
        &[("F.txt", "A")],
        &[("F.txt", "A-new"), ("G.txt", "added")],
    );

    let mut orchestrator = start_update(&fixture, downloader);
    let (snapshot, asked) = drive(&mut orchestrator, |_| ConflictOutcome::Cancel);

    assert_eq!(asked, vec!["F.txt".to_string()]);
    assert!(snapshot.done);
    assert_eq!(snapshot.outcome, Some(RunOutcome::Cancelled));
    assert_eq!(snapshot.fault, None);
    assert_eq!(orchestrator.poll_fault(), None);
    assert_eq!(fixture.read_live("F.txt").as_deref(), Some("B"));
    assert_eq!(fixture.read_live("G.txt"), None);
}

#[test]
fn length_mismatch_counts_as_modified() {
    let fixture = Fixture::new();
    fixture.write_live("F.txt", "A plus more");
    let downloader = archives(&[("F.txt", "A")], &[("F.txt", "A-new")]);

    let mut orchestrator = start_update(&fixture, downloader);
    let (_, asked) = drive(&mut orchestrator, |_| ConflictOutcome::KeepLocal);

    assert_eq!(asked, vec!["F.txt".to_string()]);
}

#[test]
fn conflicts_are_raised_one_at_a_time_in_archive_order() {
    let fixture = Fixture::new();
    fixture.write_live("b.txt", "edited b");
    fixture.write_live("a.txt", "edited a");
    let downloader = archives(
        &[("b.txt", "b"), ("a.txt", "a")],
        &[("a.txt", "a2"), ("b.txt", "b2")],
    );

    let mut orchestrator = start_update(&fixture, downloader);
    let first = wait_for_conflict(&orchestrator);
    assert_eq!(first.path(), "b.txt");
    assert_eq!(orchestrator.poll_conflict(), Some(first.clone()));
    orchestrator
        .resolve_conflict(ConflictOutcome::KeepLocal)
        .expect("first conflict must resolve");

    let second = wait_for_conflict(&orchestrator);
    assert_eq!(second.path(), "a.txt");
    orchestrator
        .resolve_conflict(ConflictOutcome::Overwrite)
        .expect("second conflict must resolve");

    let snapshot = orchestrator.wait();
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(fixture.read_live("b.txt").as_deref(), Some("edited b"));
    assert_eq!(fixture.read_live("a.txt").as_deref(), Some("a2"));
}

#[test]
fn protected_paths_are_never_touched() {
    let fixture = Fixture::new();
    fixture.write_live("config/preferences.json", "mine");
    fixture.write_live("imgui.ini", "layout");
    fixture.write_live("rainup.exe", "running updater");
    let downloader = archives(
        &[
            ("config/preferences.json", "defaults"),
            ("imgui.ini", "default layout"),
            ("rainup.exe", "old updater"),
        ],
        &[
            ("config/preferences.json", "new defaults"),
            ("imgui.ini", "new layout"),
            ("rainup.exe", "new updater"),
        ],
    );

    let settings = InstallSettings::new(
        UpdaterEnv::new(&fixture.install_dir, Platform::Windows)
            .with_self_executable(fixture.live("rainup.exe")),
    )
    .with_cache(CacheLayout::new(&fixture.cache_dir));
    let mut orchestrator = InstallOrchestrator::start(
        settings,
        downloader,
        Some(release("v1.0.0", OLD_URL)),
        release("v1.1.0", NEW_URL),
    )
    .expect("orchestrator must start");
    let (snapshot, asked) = drive(&mut orchestrator, no_conflicts);

    assert!(asked.is_empty());
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(
        fixture.read_live("config/preferences.json").as_deref(),
        Some("mine")
    );
    assert_eq!(fixture.read_live("imgui.ini").as_deref(), Some("layout"));
    assert_eq!(
        fixture.read_live("rainup.exe").as_deref(),
        Some("running updater")
    );
}

#[test]
fn fresh_install_writes_missing_protected_defaults_only() {
    let fixture = Fixture::new();
    fixture.write_live("config/preferences.json", "mine");
    let downloader = Arc::new(MemoryDownloader::default().with(
        NEW_URL,
        zip_bytes(&[
            ("config/preferences.json", "defaults"),
            ("imgui.ini", "default layout"),
        ]),
    ));

    let mut orchestrator = InstallOrchestrator::start(
        fixture.settings(Platform::Windows),
        downloader,
        None,
        release("v1.1.0", NEW_URL),
    )
    .expect("orchestrator must start");
    let (snapshot, _) = drive(&mut orchestrator, no_conflicts);

    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(
        fixture.read_live("config/preferences.json").as_deref(),
        Some("mine")
    );
    assert_eq!(
        fixture.read_live("imgui.ini").as_deref(),
        Some("default layout")
    );
}

#[test]
fn unchecked_prefixes_are_replaced_without_diffing() {
    let fixture = Fixture::new();
    fixture.write_live("assets/tiles/init.txt", "hand edited");
    fixture.write_live("data/old-only.bin", "stale");
    let downloader = archives(
        &[
            ("assets/tiles/init.txt", "tiles v1"),
            ("data/old-only.bin", "old data"),
        ],
        &[("assets/tiles/init.txt", "tiles v2")],
    );

    let mut orchestrator = start_update(&fixture, downloader);
    let (snapshot, asked) = drive(&mut orchestrator, no_conflicts);

    assert!(asked.is_empty());
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(
        fixture.read_live("assets/tiles/init.txt").as_deref(),
        Some("tiles v2")
    );
    assert_eq!(fixture.read_live("data/old-only.bin"), None);
    assert!(!fixture.live("data").exists(), "emptied directory must be pruned");
}

#[test]
fn end_to_end_keep_local_update() {
    let fixture = Fixture::new();
    fixture.write_live("A.txt", "A1");
    fixture.write_live("docs/B.txt", "B edited");
    fixture.write_live("legacy/C.txt", "C1");
    fixture.write_live("notes/user.txt", "not from any release");
    let downloader = archives(
        &[("A.txt", "A1"), ("docs/B.txt", "B1"), ("legacy/C.txt", "C1")],
        &[("A.txt", "A2"), ("docs/B.txt", "B2"), ("D.txt", "D2")],
    );

    let mut orchestrator = start_update(&fixture, downloader);
    let (snapshot, asked) = drive(&mut orchestrator, |request| {
        assert_eq!(request.path(), "docs/B.txt");
        ConflictOutcome::KeepLocal
    });

    assert_eq!(asked, vec!["docs/B.txt".to_string()]);
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(snapshot.kept_local, vec!["docs/B.txt".to_string()]);
    assert_eq!(fixture.read_live("A.txt").as_deref(), Some("A2"));
    assert_eq!(fixture.read_live("docs/B.txt").as_deref(), Some("B edited"));
    assert_eq!(fixture.read_live("legacy/C.txt"), None);
    assert!(!fixture.live("legacy").exists());
    assert_eq!(fixture.read_live("D.txt").as_deref(), Some("D2"));
    assert_eq!(
        fixture.read_live("notes/user.txt").as_deref(),
        Some("not from any release")
    );
    assert!(fixture.install_dir.is_dir());
}

#[test]
fn gzipped_tar_releases_update_in_place() {
    let fixture = Fixture::new();
    fixture.write_live("Rained", "bin v1");
    fixture.write_live("config/theme.json", "edited");
    let downloader = Arc::new(
        MemoryDownloader::default()
            .with(
                OLD_TGZ_URL,
                tar_gz_bytes(&[("Rained", "bin v1"), ("config/theme.json", "theme v1")]),
            )
            .with(
                NEW_TGZ_URL,
                tar_gz_bytes(&[("Rained", "bin v2"), ("config/theme.json", "theme v2")]),
            ),
    );

    let mut orchestrator = InstallOrchestrator::start(
        fixture.settings(Platform::Linux),
        downloader,
        Some(linux_release("v1.0.0", OLD_TGZ_URL)),
        linux_release("v1.1.0", NEW_TGZ_URL),
    )
    .expect("orchestrator must start");
    let (snapshot, asked) = drive(&mut orchestrator, |_| ConflictOutcome::Overwrite);

    assert_eq!(asked, vec!["config/theme.json".to_string()]);
    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(fixture.read_live("Rained").as_deref(), Some("bin v2"));
    assert_eq!(
        fixture.read_live("config/theme.json").as_deref(),
        Some("theme v2")
    );
    assert!(fixture.cache_dir.join("v1.0.0-linux.tar.gz").is_file());
}

#[test]
fn cancel_during_fetch_is_clean_and_discards_partial_download() {
    let fixture = Fixture::new();
    let downloader = Arc::new(StallingDownloader::default());

    let mut orchestrator = InstallOrchestrator::start(
        fixture.settings(Platform::Windows),
        downloader.clone(),
        None,
        release("v1.1.0", NEW_URL),
    )
    .expect("orchestrator must start");

    let deadline = Instant::now() + Duration::from_secs(30);
    while !downloader.started.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "download never started");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(
        orchestrator.snapshot().phase,
        InstallPhase::FetchingNew
    );
    orchestrator.cancel();
    let snapshot = orchestrator.wait();

    assert!(snapshot.done);
    assert!(snapshot.cancelled);
    assert_eq!(snapshot.outcome, Some(RunOutcome::Cancelled));
    assert_eq!(snapshot.fault, None);
    let leftovers: Vec<_> = fs::read_dir(&fixture.cache_dir)
        .expect("cache dir must exist")
        .collect();
    assert!(leftovers.is_empty(), "partial download must be discarded");
}

#[test]
fn cancel_releases_a_parked_conflict() {
    let fixture = Fixture::new();
    fixture.write_live("F.txt", "B");
    let downloader = archives(&[("F.txt", "A")], &[("F.txt", "A-new")]);

    let mut orchestrator = start_update(&fixture, downloader);
    wait_for_conflict(&orchestrator);
    orchestrator.cancel();
    let snapshot = orchestrator.wait();

    assert_eq!(snapshot.outcome, Some(RunOutcome::Cancelled));
    assert_eq!(orchestrator.poll_conflict(), None);
    assert_eq!(fixture.read_live("F.txt").as_deref(), Some("B"));
}

#[test]
fn dropping_with_a_parked_conflict_does_not_hang() {
    let fixture = Fixture::new();
    fixture.write_live("F.txt", "B");
    let downloader = archives(&[("F.txt", "A")], &[("F.txt", "A-new")]);

    let orchestrator = start_update(&fixture, downloader);
    wait_for_conflict(&orchestrator);
    drop(orchestrator);

    assert_eq!(fixture.read_live("F.txt").as_deref(), Some("B"));
}

#[test]
fn resolving_without_a_pending_conflict_is_an_error() {
    let fixture = Fixture::new();
    let downloader = archives(&[], &[("F.txt", "new")]);

    let mut orchestrator = start_update(&fixture, downloader);
    let (snapshot, _) = drive(&mut orchestrator, no_conflicts);

    assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
    assert_eq!(
        orchestrator.resolve_conflict(ConflictOutcome::Overwrite),
        Err(ConflictError::NoPendingConflict)
    );
}

#[test]
fn transfer_failure_faults_the_run() {
    let fixture = Fixture::new();
    let downloader = Arc::new(MemoryDownloader::default());

    let mut orchestrator = InstallOrchestrator::start(
        fixture.settings(Platform::Windows),
        downloader,
        None,
        release("v1.1.0", NEW_URL),
    )
    .expect("orchestrator must start");
    let snapshot = orchestrator.wait();

    assert_eq!(snapshot.outcome, Some(RunOutcome::Faulted));
    let fault = orchestrator.poll_fault().expect("fault must be published");
    assert!(fault.contains("status 404"), "unexpected fault: {fault}");
    assert!(!fixture
        .cache_dir
        .join("v1.1.0-windows.zip.part")
        .exists());
}

#[test]
fn missing_platform_build_faults_the_run() {
    let fixture = Fixture::new();
    let downloader = Arc::new(MemoryDownloader::default());

    let mut orchestrator = InstallOrchestrator::start(
        fixture.settings(Platform::Windows),
        downloader.clone(),
        None,
        linux_release("v1.1.0", NEW_TGZ_URL),
    )
    .expect("orchestrator must start");
    let snapshot = orchestrator.wait();

    assert_eq!(snapshot.outcome, Some(RunOutcome::Faulted));
    assert_eq!(
        snapshot.fault.as_deref(),
        Some("release v1.1.0 has no build for windows")
    );
    assert!(downloader.requests().is_empty());
}

#[test]
fn corrupt_archive_faults_the_run() {
    let fixture = Fixture::new();
    let downloader = Arc::new(
        MemoryDownloader::default().with(NEW_URL, b"this is not a zip file".to_vec()),
    );

    let mut orchestrator = InstallOrchestrator::start(
        fixture.settings(Platform::Windows),
        downloader,
        None,
        release("v1.1.0", NEW_URL),
    )
    .expect("orchestrator must start");
    let snapshot = orchestrator.wait();

    assert_eq!(snapshot.outcome, Some(RunOutcome::Faulted));
    let fault = snapshot.fault.expect("fault must be published");
    assert!(
        fault.contains("could not read archive directory"),
        "unexpected fault: {fault}"
    );
}

#[test]
fn cached_archives_are_not_downloaded_again() {
    let fixture = Fixture::new();
    let downloader = Arc::new(
        MemoryDownloader::default().with(NEW_URL, zip_bytes(&[("F.txt", "new")])),
    );

    for _ in 0..2 {
        let mut orchestrator = InstallOrchestrator::start(
            fixture.settings(Platform::Windows),
            downloader.clone(),
            None,
            release("v1.1.0", NEW_URL),
        )
        .expect("orchestrator must start");
        assert_eq!(orchestrator.wait().outcome, Some(RunOutcome::Completed));
    }

    assert_eq!(downloader.requests(), vec![NEW_URL.to_string()]);
}

#[test]
fn contents_match_compares_through_eof() {
    let big = vec![7_u8; 200 * 1024];
    let mut big_changed = big.clone();
    let last = big_changed.len() - 1;
    big_changed[last] = 8;

    let cases: [(&[u8], &[u8], bool); 6] = [
        (&b""[..], &b""[..], true),
        (&b"same"[..], &b"same"[..], true),
        (&b"same"[..], &b"sane"[..], false),
        (&b"short"[..], &b"short but longer"[..], false),
        (big.as_slice(), big.as_slice(), true),
        (big.as_slice(), big_changed.as_slice(), false),
    ];
    for (live, archived, expected) in cases {
        let result = contents_match(&mut Cursor::new(live), &mut Cursor::new(archived))
            .expect("comparison must succeed");
        assert_eq!(result, expected, "live {} bytes vs {}", live.len(), archived.len());
    }
}

#[test]
fn prune_removes_emptied_directories_up_to_root() {
    let root = TempDir::new().expect("must create temp dir");
    let deep = root.path().join("a").join("b").join("c");
    let kept = root.path().join("a").join("keep");
    fs::create_dir_all(&deep).expect("must create deep dir");
    fs::create_dir_all(&kept).expect("must create kept dir");
    fs::write(kept.join("file.txt"), "x").expect("must write kept file");

    let touched = BTreeSet::from([deep.clone(), root.path().to_path_buf()]);
    let removed = prune_empty_dirs(root.path(), &touched).expect("prune must succeed");

    assert_eq!(removed, vec![deep.clone(), root.path().join("a").join("b")]);
    assert!(!deep.exists());
    assert!(kept.join("file.txt").exists());
    assert!(root.path().is_dir());
}

#[test]
fn prune_never_removes_empty_root() {
    let root = TempDir::new().expect("must create temp dir");
    let touched = BTreeSet::from([root.path().to_path_buf()]);
    let removed = prune_empty_dirs(root.path(), &touched).expect("prune must succeed");
    assert!(removed.is_empty());
    assert!(root.path().is_dir());
}

#[test]
fn policy_defaults_and_executable_protection() {
    let mut policy = ProtectedPathPolicy::default();
    assert!(policy.is_protected("config/preferences.json"));
    assert!(policy.is_protected("imgui.ini"));
    assert!(!policy.is_protected("Rained.exe"));
    assert!(policy.skips_diff("assets/tiles/init.txt"));
    assert!(policy.skips_diff("data/levels.bin"));
    assert!(!policy.skips_diff("config/theme.json"));

    let install_dir = Path::new("/opt/rained");
    policy.protect_executable(install_dir, &install_dir.join("bin").join("rainup"));
    policy.protect_executable(install_dir, Path::new("/usr/bin/rainup"));
    assert!(policy.is_protected("bin/rainup"));
    assert_eq!(policy.protected_paths().count(), 3);
}

#[test]
fn policy_normalizes_configured_paths() {
    let policy = ProtectedPathPolicy::new(["./config\\prefs.json", ""], ["levels\\"]);
    assert!(policy.is_protected("config/prefs.json"));
    assert!(policy.skips_diff("levels/one.txt"));
    assert_eq!(policy.protected_paths().count(), 1);
}

#[test]
fn cache_layout_names_archives_by_label_and_platform() {
    let layout = CacheLayout::new("/var/cache/rainup");
    let cache_path = layout.archive_cache_path(
        &ReleaseDescriptor::new("b3.0/rc"),
        Platform::Linux,
        rainup_core::ArchiveType::TarGz,
    );
    assert_eq!(
        cache_path,
        Path::new("/var/cache/rainup").join("b3.0%2Frc-linux.tar.gz")
    );
    assert_eq!(
        CacheLayout::part_path(&cache_path),
        Path::new("/var/cache/rainup").join("b3.0%2Frc-linux.tar.gz.part")
    );
    assert_eq!(
        CacheLayout::for_install_dir(Path::new("/opt/rained")).cache_dir(),
        Path::new("/opt/rained").join(".rainup").join("cache")
    );
}

#[test]
fn cached_archives_skips_partial_downloads() {
    let root = TempDir::new().expect("must create temp dir");
    let layout = CacheLayout::new(root.path().join("cache"));
    assert!(layout
        .cached_archives()
        .expect("missing cache dir must list as empty")
        .is_empty());

    layout.ensure_dirs().expect("must create cache dir");
    fs::write(layout.cache_dir().join("v2-linux.tar.gz"), "x").expect("must write archive");
    fs::write(layout.cache_dir().join("v1-windows.zip"), "x").expect("must write archive");
    fs::write(layout.cache_dir().join("v3-linux.tar.gz.part"), "x").expect("must write part");

    assert_eq!(
        layout.cached_archives().expect("must list cache"),
        vec![
            layout.cache_dir().join("v1-windows.zip"),
            layout.cache_dir().join("v2-linux.tar.gz"),
        ]
    );
}

#[test]
fn fetch_release_archive_reuses_cache_hit() {
    let root = TempDir::new().expect("must create temp dir");
    let layout = CacheLayout::new(root.path());
    let descriptor = release("v1.1.0", NEW_URL);
    let cached = root.path().join("v1.1.0-windows.zip");
    fs::write(&cached, "cached").expect("must seed cache");
    let downloader = MemoryDownloader::default();

    let outcome = fetch_release_archive(
        &downloader,
        &layout,
        &descriptor,
        Platform::Windows,
        &mut |_, _| true,
    )
    .expect("cache hit must succeed");

    assert_eq!(outcome, FetchOutcome::CacheHit(cached.clone()));
    assert_eq!(outcome.path(), Some(cached.as_path()));
    assert!(downloader.requests().is_empty());
}

#[test]
fn fetch_release_archive_discards_part_on_abort() {
    let root = TempDir::new().expect("must create temp dir");
    let layout = CacheLayout::new(root.path().join("cache"));
    let descriptor = release("v1.1.0", NEW_URL);
    let downloader = MemoryDownloader::default().with(NEW_URL, vec![1_u8; 1024]);
    let mut calls = 0;

    let outcome = fetch_release_archive(
        &downloader,
        &layout,
        &descriptor,
        Platform::Windows,
        &mut |_, _| {
            calls += 1;
            calls < 3
        },
    )
    .expect("abort is not an error");

    assert_eq!(outcome, FetchOutcome::Aborted);
    assert_eq!(outcome.path(), None);
    assert!(layout.cached_archives().expect("must list").is_empty());
    assert!(!layout.cache_dir().join("v1.1.0-windows.zip.part").exists());
}

#[test]
fn fetch_release_archive_downloads_and_renames() {
    let root = TempDir::new().expect("must create temp dir");
    let layout = CacheLayout::new(root.path().join("cache"));
    let descriptor = release("v1.1.0", NEW_URL);
    let payload = vec![3_u8; 300];
    let downloader = MemoryDownloader::default().with(NEW_URL, payload.clone());
    let mut observed = Vec::new();

    let outcome = fetch_release_archive(
        &downloader,
        &layout,
        &descriptor,
        Platform::Windows,
        &mut |done, total| {
            observed.push((done, total));
            true
        },
    )
    .expect("download must succeed");

    let cached = layout.cache_dir().join("v1.1.0-windows.zip");
    assert_eq!(outcome, FetchOutcome::Downloaded(cached.clone()));
    assert_eq!(fs::read(&cached).expect("must read cached archive"), payload);
    assert_eq!(observed.last(), Some(&(300, Some(300))));
}

#[test]
fn fault_message_includes_sources() {
    let err = InstallError::filesystem(
        "delete",
        "/opt/rained/Rained.exe",
        io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
    );
    let message = err.fault_message();
    assert!(message.starts_with("failed to delete "), "{message}");
    assert!(message.ends_with(": access denied"), "{message}");
}

fn start_one_shot_http_server(response_head: String, payload: Vec<u8>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("must bind one-shot test server");
    let address = listener
        .local_addr()
        .expect("must read one-shot test server address");
    let url = format!("http://{address}/rained-windows.zip");
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("must accept test client");
        let mut request_buffer = [0_u8; 1024];
        let _ = stream.read(&mut request_buffer);
        // The client may hang up early when it aborts.
        let _ = stream.write_all(response_head.as_bytes());
        let _ = stream.write_all(&payload);
        let _ = stream.flush();
    });
    (url, handle)
}

/// Sends `response_head` and `prefix`, then holds the connection open
/// without sending more until `release` fires or ten seconds pass.
fn start_stalling_http_server(
    response_head: String,
    prefix: Vec<u8>,
) -> (String, mpsc::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("must bind stalling test server");
    let address = listener
        .local_addr()
        .expect("must read stalling test server address");
    let url = format!("http://{address}/rained-windows.zip");
    let (release, released) = mpsc::channel();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("must accept test client");
        let mut request_buffer = [0_u8; 1024];
        let _ = stream.read(&mut request_buffer);
        let _ = stream.write_all(response_head.as_bytes());
        let _ = stream.write_all(&prefix);
        let _ = stream.flush();
        let _ = released.recv_timeout(Duration::from_secs(10));
    });
    (url, release, handle)
}

fn ok_head(length: Option<usize>) -> String {
    match length {
        Some(length) => format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {length}\r\nConnection: close\r\n\r\n"
        ),
        None => "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_string(),
    }
}

#[test]
fn http_downloader_reports_progress_with_known_total() {
    let root = TempDir::new().expect("must create temp dir");
    let payload = b"rainup-progress-known-total".to_vec();
    let (url, server) = start_one_shot_http_server(ok_head(Some(payload.len())), payload.clone());
    let dest = root.path().join("download.bin");
    let mut observed = Vec::new();

    let status = HttpDownloader::new()
        .expect("client must build")
        .fetch(&url, &dest, &mut |done, total| {
            observed.push((done, total));
            true
        })
        .expect("download must succeed");
    server.join().expect("server thread must join");

    assert_eq!(status, FetchStatus::Completed);
    assert_eq!(fs::read(&dest).expect("must read download"), payload);
    let last = observed.last().expect("must have progress events");
    assert_eq!(*last, (payload.len() as u64, Some(payload.len() as u64)));
}

#[test]
fn http_downloader_reports_progress_without_total() {
    let root = TempDir::new().expect("must create temp dir");
    let payload = b"rainup-progress-unknown-total".to_vec();
    let (url, server) = start_one_shot_http_server(ok_head(None), payload.clone());
    let dest = root.path().join("download.bin");
    let mut observed = Vec::new();

    let status = HttpDownloader::new()
        .expect("client must build")
        .fetch(&url, &dest, &mut |done, total| {
            observed.push((done, total));
            true
        })
        .expect("download must succeed");
    server.join().expect("server thread must join");

    assert_eq!(status, FetchStatus::Completed);
    assert_eq!(fs::read(&dest).expect("must read download"), payload);
    let last = observed.last().expect("must have progress events");
    assert_eq!(*last, (payload.len() as u64, None));
}

#[test]
fn http_downloader_rejects_error_status() {
    let root = TempDir::new().expect("must create temp dir");
    let (url, server) = start_one_shot_http_server(
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
        Vec::new(),
    );
    let dest = root.path().join("download.bin");

    let err = HttpDownloader::new()
        .expect("client must build")
        .fetch(&url, &dest, &mut |_, _| true)
        .expect_err("404 must fail");
    server.join().expect("server thread must join");

    assert!(
        matches!(err, FetchError::Transfer { status: 404, .. }),
        "unexpected error: {err}"
    );
    assert!(!dest.exists());
}

#[test]
fn http_downloader_stops_when_progress_declines() {
    let root = TempDir::new().expect("must create temp dir");
    let payload = vec![9_u8; 4096];
    let (url, server) = start_one_shot_http_server(ok_head(Some(payload.len())), payload);
    let dest = root.path().join("download.bin");

    let status = HttpDownloader::new()
        .expect("client must build")
        .fetch(&url, &dest, &mut |_, _| false)
        .expect("abort is not an error");
    server.join().expect("server thread must join");

    assert_eq!(status, FetchStatus::Aborted);
}

#[test]
fn http_downloader_gives_up_on_a_stalled_body() {
    let root = TempDir::new().expect("must create temp dir");
    let (url, release, server) =
        start_stalling_http_server(ok_head(Some(100)), b"partial".to_vec());
    let dest = root.path().join("download.bin");

    let started = Instant::now();
    let result = HttpDownloader::with_timeout(Duration::from_millis(300))
        .expect("client must build")
        .fetch(&url, &dest, &mut |_, _| true);
    let elapsed = started.elapsed();
    let _ = release.send(());
    server.join().expect("server thread must join");

    assert!(result.is_err(), "stalled body must fail, got {result:?}");
    assert!(
        elapsed < Duration::from_secs(5),
        "stalled read took {elapsed:?}"
    );
}

#[test]
fn cancel_during_stalled_http_download_finishes_promptly() {
    let fixture = Fixture::new();
    let (url, release_server, server) =
        start_stalling_http_server(ok_head(Some(100)), b"partial".to_vec());
    let downloader = Arc::new(
        HttpDownloader::with_timeout(Duration::from_secs(1)).expect("client must build"),
    );

    let mut orchestrator = InstallOrchestrator::start(
        fixture.settings(Platform::Windows),
        downloader,
        None,
        release("v1.1.0", &url),
    )
    .expect("orchestrator must start");

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = orchestrator.snapshot();
        if snapshot.phase == InstallPhase::FetchingNew
            && snapshot.fraction.is_some_and(|fraction| fraction > 0.0)
        {
            break;
        }
        assert!(snapshot.outcome.is_none(), "run ended before stalling: {snapshot:?}");
        assert!(Instant::now() < deadline, "download never made progress");
        thread::sleep(Duration::from_millis(2));
    }
    orchestrator.cancel();

    let deadline = Instant::now() + Duration::from_secs(10);
    while orchestrator.outcome().is_none() {
        assert!(Instant::now() < deadline, "cancelled run stayed in the stalled read");
        thread::sleep(Duration::from_millis(5));
    }
    let snapshot = orchestrator.wait();
    let _ = release_server.send(());
    server.join().expect("server thread must join");

    assert_eq!(snapshot.outcome, Some(RunOutcome::Cancelled));
    assert_eq!(snapshot.fault, None);
    let leftovers: Vec<_> = fs::read_dir(&fixture.cache_dir)
        .expect("cache dir must exist")
        .collect();
    assert!(leftovers.is_empty(), "partial download must be discarded");
}
