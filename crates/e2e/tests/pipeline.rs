//! Full pipeline run against shell-script stand-ins for the external tools
//!
//! `git`, `sudo`, `rr`, `docker` and the server are small scripts in a temp
//! directory; the browser is an in-memory driver that keeps the notebook text
//! across page loads the way the real server persists it.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use onprem_e2e::browser::{keys, BrowserDriver, BrowserLauncher, ElementRef, KeyAction};
use onprem_e2e::verdict::{write_verdict, PASS_MARKER};
use onprem_e2e::{E2eError, E2eResult, Scenario, SmokeConfig, Stage};

/// Tests here write scripts and then exec them; running them one at a time
/// keeps a sibling test's fork from holding a script open for writing.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Everything the fake UI renders, so every text wait succeeds.
const PAGE_TEXT: &str = "_exit.c file.c _exit ( helper_function Notebook";

#[derive(Default)]
struct Page {
    navigations: u32,
    /// Text area contents of the open page.
    draft: String,
    /// What the "server" has persisted.
    persisted: String,
    control_held: bool,
    closed: bool,
}

#[derive(Clone, Default)]
struct FakeBrowser {
    page: Arc<Mutex<Page>>,
    /// The UI never renders anything the pipeline waits for.
    blank: bool,
}

#[async_trait]
impl BrowserDriver for FakeBrowser {
    async fn navigate(&self, url: &str) -> E2eResult<()> {
        let mut page = self.page.lock().unwrap();
        page.navigations += 1;
        if url == "about:blank" {
            page.persisted = page.draft.clone();
            return Ok(());
        }
        // The first load races the server coming up.
        if page.navigations == 1 {
            return Err(E2eError::WebDriver {
                code: "unknown error".into(),
                message: "connectionFailure".into(),
            });
        }
        page.draft = page.persisted.clone();
        Ok(())
    }

    async fn find_element(&self, selector: &str) -> E2eResult<ElementRef> {
        Ok(ElementRef(selector.to_string()))
    }

    async fn element_text(&self, _element: &ElementRef) -> E2eResult<String> {
        if self.blank {
            return Ok(String::new());
        }
        Ok(PAGE_TEXT.to_string())
    }

    async fn click(&self, _element: &ElementRef) -> E2eResult<()> {
        Ok(())
    }

    async fn send_keys(&self, _element: &ElementRef, _text: &str) -> E2eResult<()> {
        Ok(())
    }

    async fn perform_keys(&self, actions: &[KeyAction]) -> E2eResult<()> {
        let mut page = self.page.lock().unwrap();
        for action in actions {
            match action {
                KeyAction::Down(key) if key == keys::CONTROL => page.control_held = true,
                KeyAction::Up(key) if key == keys::CONTROL => page.control_held = false,
                KeyAction::Down(key) if !page.control_held => page.draft.push_str(key),
                _ => {}
            }
        }
        Ok(())
    }

    async fn execute_script(&self, script: &str) -> E2eResult<Value> {
        let page = self.page.lock().unwrap();
        if script.contains("classList.contains('focus')") {
            Ok(json!(true))
        } else if script.contains("textarea').value") {
            Ok(json!(page.draft))
        } else {
            Err(E2eError::Javascript(format!("unexpected script: {script}")))
        }
    }

    async fn switch_to_frame(&self, _element: &ElementRef) -> E2eResult<()> {
        Ok(())
    }

    async fn switch_to_window(&self, _handle: &str) -> E2eResult<()> {
        Ok(())
    }

    async fn window_handles(&self) -> E2eResult<Vec<String>> {
        Ok(vec!["main".to_string()])
    }

    async fn quit(&self) -> E2eResult<()> {
        self.page.lock().unwrap().closed = true;
        Ok(())
    }
}

struct FakeLauncher {
    browser: FakeBrowser,
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    type Driver = FakeBrowser;

    async fn launch(&self) -> E2eResult<FakeBrowser> {
        Ok(self.browser.clone())
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn write_sources_zip(path: &Path, entries: &[String]) {
    let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
    for name in entries {
        writer.start_file(name.as_str(), SimpleFileOptions::default()).unwrap();
        writer.write_all(b"#define MESSAGE \"hello\"\n").unwrap();
    }
    writer.finish().unwrap();
}

struct Fixture {
    _tmp: TempDir,
    work: PathBuf,
    calls: PathBuf,
    config: SmokeConfig,
}

fn fixture(docker_output: &str) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let bin = tmp.path().join("bin");
    let work = tmp.path().join("work");
    fs::create_dir_all(&bin).unwrap();
    let calls = tmp.path().join("calls.log");

    let sample_zip = tmp.path().join("sources.zip");
    write_sources_zip(
        &sample_zip,
        &[
            work.join("alias/pernosco-submit-test/out/message.h")
                .to_string_lossy()
                .into_owned(),
            "/usr/include/stdio.h".to_string(),
        ],
    );

    let log = calls.display();
    let git = write_script(
        &bin,
        "git",
        &format!(
            "echo \"git $*\" >> {log}\n\
             if [ \"$1\" = clone ]; then\n\
               mkdir -p \"$3\"\n\
               printf '#!/bin/sh\\nmkdir -p out && touch out/main\\n' > \"$3/build.sh\"\n\
               chmod +x \"$3/build.sh\"\n\
             fi\n"
        ),
    );
    let sudo = write_script(&bin, "sudo", &format!("echo \"sudo $*\" >> {log}\n"));
    let rr = write_script(
        &bin,
        "rr",
        &format!(
            "echo \"rr $*\" >> {log}\n\
             name=$(basename \"$2\")\n\
             n=0\n\
             while [ -d \"$_RR_TRACE_DIR/$name-$n\" ]; do n=$((n+1)); done\n\
             mkdir -p \"$_RR_TRACE_DIR/$name-$n\"\n"
        ),
    );
    let docker = write_script(&bin, "docker", &format!("printf '{docker_output}'\n"));
    let server = write_script(
        &bin,
        "pernosco",
        &format!(
            "echo \"pernosco $*\" >> {log}\n\
             for last; do :; done\n\
             case \" $* \" in\n\
               *\" serve \"*)\n\
                 trap 'echo interrupted >> {log}; exit 0' INT\n\
                 echo 'Loading trace'\n\
                 echo 'Appserver listening on http://127.0.0.1:9/'\n\
                 while :; do sleep 0.05; done ;;\n\
               *\" --copy-sources \"*)\n\
                 mkdir -p \"$last/files.user\"\n\
                 cp {} \"$last/files.user/sources.zip\" ;;\n\
             esac\n",
            sample_zip.display()
        ),
    );

    let mut config = SmokeConfig::default();
    config.workspace.root = Some(work.clone());
    config.tools.git = git;
    config.tools.sudo = sudo;
    config.tools.tracer = rr;
    config.tools.docker = docker;
    config.tools.server = server;
    config.server.pull = false;
    config.server.startup_timeout_secs = 10;
    config.browser.ui_timeout_secs = 5;
    config.browser.navigate_delay_ms = 1;
    config.browser.flush_delay_ms = 0;

    Fixture {
        _tmp: tmp,
        work,
        calls,
        config,
    }
}

#[tokio::test]
async fn test_full_pipeline_passes() {
    let _serial = serial();
    let fx = fixture("");
    let browser = FakeBrowser::default();
    let launcher = FakeLauncher {
        browser: browser.clone(),
    };

    let outcome = Scenario::new(fx.config.clone(), launcher).unwrap().run().await;
    if let Err(e) = &outcome.result {
        panic!("pipeline failed: {e}");
    }

    assert!(outcome.report.passed);
    assert_eq!(
        outcome.report.completed.iter().map(|r| r.stage).collect::<Vec<_>>(),
        Stage::ALL.to_vec()
    );

    let page = browser.page.lock().unwrap();
    assert_eq!(page.persisted, "HelloKitty");
    assert_eq!(page.draft, "HelloKitty");
    assert!(page.closed);
    drop(page);

    let calls = fs::read_to_string(&fx.calls).unwrap();
    let trace = fx.work.join("main-0");
    assert!(trace.is_dir());
    assert!(calls.contains(&format!(
        "pernosco -x --log info:/proc/self/fd/2 --no-pull --user 1200 build --check-trace {}",
        trace.display()
    )));
    assert_eq!(calls.matches(" serve --storage ").count(), 2);
    assert_eq!(calls.lines().filter(|l| *l == "interrupted").count(), 2);
    assert!(calls.contains(&format!(
        "--sources {}={} --sources /usr {}",
        fx.work.display(),
        fx.work.join("alias").display(),
        trace.display()
    )));
    assert!(calls.trim_end().ends_with(&format!(
        "sudo umount {}",
        fx.work.join("alias/pernosco-submit-test").display()
    )));

    let mut stderr = Vec::new();
    assert!(write_verdict(&mut stderr, &outcome.result).unwrap());
    let stderr = String::from_utf8(stderr).unwrap();
    assert_eq!(stderr.lines().filter(|l| *l == PASS_MARKER).count(), 1);
}

#[tokio::test]
async fn test_leftover_containers_fail_and_release_mount() {
    let _serial = serial();
    let fx = fixture("3f2a9c1d\\n");
    let launcher = FakeLauncher {
        browser: FakeBrowser::default(),
    };

    let outcome = Scenario::new(fx.config.clone(), launcher).unwrap().run().await;

    assert!(matches!(outcome.result, Err(E2eError::AssertionFailed(_))));
    assert_eq!(outcome.report.failed_stage, Some(Stage::ContainerCleanupCheck));
    assert!(!outcome.report.passed);

    let calls = fs::read_to_string(&fx.calls).unwrap();
    assert!(!calls.contains("--copy-sources"));
    assert!(calls.trim_end().ends_with(&format!(
        "sudo umount {}",
        fx.work.join("alias/pernosco-submit-test").display()
    )));

    let mut stderr = Vec::new();
    assert!(!write_verdict(&mut stderr, &outcome.result).unwrap());
    assert!(!String::from_utf8(stderr).unwrap().contains(PASS_MARKER));
}

#[tokio::test]
async fn test_missing_export_entry_fails() {
    let _serial = serial();
    let mut fx = fixture("");
    fx.config.checks.export_alias_paths = false;
    let launcher = FakeLauncher {
        browser: FakeBrowser::default(),
    };

    let outcome = Scenario::new(fx.config.clone(), launcher).unwrap().run().await;

    match outcome.result {
        Err(E2eError::AssertionFailed(message)) => {
            assert!(message.contains("pernosco-submit-test/out/message.h"))
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(()) => panic!("export check should have failed"),
    }
    assert_eq!(outcome.report.failed_stage, Some(Stage::ExportVerify));
}

#[tokio::test]
async fn test_ui_failure_interrupts_server_and_releases_mount() {
    let _serial = serial();
    let mut fx = fixture("");
    fx.config.browser.ui_timeout_secs = 1;
    let browser = FakeBrowser {
        blank: true,
        ..FakeBrowser::default()
    };
    let launcher = FakeLauncher {
        browser: browser.clone(),
    };

    let outcome = Scenario::new(fx.config.clone(), launcher).unwrap().run().await;

    assert!(
        matches!(outcome.result, Err(E2eError::Timeout { .. })),
        "unexpected result: {:?}",
        outcome.result.as_ref().err().map(ToString::to_string)
    );
    assert_eq!(outcome.report.failed_stage, Some(Stage::ServeAndReadSources));
    assert!(browser.page.lock().unwrap().closed);

    let calls = fs::read_to_string(&fx.calls).unwrap();
    let lines: Vec<&str> = calls.lines().collect();
    let serve = lines
        .iter()
        .position(|l| l.contains(" serve --storage "))
        .expect("server was never started");
    let interrupted = lines
        .iter()
        .position(|l| *l == "interrupted")
        .expect("server was not interrupted");
    assert!(serve < interrupted);
    assert_eq!(
        lines.last().copied(),
        Some(format!("sudo umount {}", fx.work.join("alias/pernosco-submit-test").display()).as_str())
    );
}
