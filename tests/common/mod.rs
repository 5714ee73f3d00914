use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;
use tokio::net::TcpListener;

use callscribe::error::Result;
use callscribe::pipeline::{RecognitionAlternative, RecognitionResult, RequestRecord, WordInfo};
use callscribe::queue::{Queue, QueueError, QueueInfo};
use callscribe::recognition::{RecognitionRequest, Recognizer};
use callscribe::storage::{Database, RequestRepository, SqliteRepository};

#[allow(dead_code)]
pub fn run_callscribe(args: &[&str]) -> Output {
    TestEnv::new().run(args)
}

#[allow(dead_code)]
pub struct TestEnv {
    home: TempDir,
    config: TempDir,
    data: TempDir,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new() -> Self {
        Self {
            home: tempfile::tempdir().expect("create temporary HOME dir"),
            config: tempfile::tempdir().expect("create temporary XDG config dir"),
            data: tempfile::tempdir().expect("create temporary XDG data dir"),
        }
    }

    pub fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_callscribe"))
            .args(args)
            .env("HOME", self.home.path())
            .env("XDG_CONFIG_HOME", self.config.path())
            .env("XDG_DATA_HOME", self.data.path())
            .env_remove("CALLSCRIBE_SPEECH_API_KEY")
            .env_remove("CALLSCRIBE_DLP_API_KEY")
            .env_remove("CALLSCRIBE_PROJECT_ID")
            .env_remove("RUST_LOG")
            .output()
            .expect("failed to execute callscribe binary")
    }

    pub fn config_path(&self) -> PathBuf {
        let output = self.run(&["config", "path"]);
        assert!(
            output.status.success(),
            "config path should succeed\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );

        let path = String::from_utf8_lossy(&output.stdout);
        PathBuf::from(path.trim())
    }

    pub fn write_config(&self, contents: &str) {
        let config_path = self.config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).expect("create config parent directory");
        }
        std::fs::write(&config_path, contents).expect("write config file");
    }
}

/// Request repository over a private in-memory database
#[allow(dead_code)]
pub fn memory_repository() -> Arc<dyn RequestRepository> {
    let db = Database::open_memory("requests").expect("open in-memory database");
    Arc::new(SqliteRepository::new(db))
}

/// Serve `router` on an ephemeral local port; returns its base URL
#[allow(dead_code)]
pub async fn spawn_router(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server");
    });
    format!("http://{}", addr)
}

#[allow(dead_code)]
pub fn queue_info(name: &str, target: &str) -> QueueInfo {
    QueueInfo {
        name: name.to_string(),
        target_service: target.to_string(),
        handler_url: format!("http://{}.invalid/task_handler", target),
    }
}

/// Queue that keeps every added record in memory
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct CapturingQueue {
    tasks: Arc<Mutex<Vec<(String, RequestRecord)>>>,
}

#[allow(dead_code)]
impl CapturingQueue {
    pub fn tasks(&self) -> Vec<(String, RequestRecord)> {
        self.tasks.lock().unwrap().clone()
    }
}

#[async_trait]
impl Queue for CapturingQueue {
    fn backend_name(&self) -> &'static str {
        "capturing"
    }

    async fn create(&self, _info: &QueueInfo) -> std::result::Result<(), QueueError> {
        Ok(())
    }

    async fn connect(&self, _info: &QueueInfo) -> std::result::Result<(), QueueError> {
        Ok(())
    }

    async fn add(
        &self,
        info: &QueueInfo,
        record: &RequestRecord,
    ) -> std::result::Result<String, QueueError> {
        self.tasks
            .lock()
            .unwrap()
            .push((info.name.clone(), record.clone()));
        Ok(info.task_name(record))
    }
}

/// Recognizer answering every request with the same word stream
#[allow(dead_code)]
pub struct ScriptedRecognizer {
    words: Vec<(&'static str, u32)>,
    calls: Mutex<usize>,
}

#[allow(dead_code)]
impl ScriptedRecognizer {
    pub fn new(words: &[(&'static str, u32)]) -> Self {
        Self {
            words: words.to_vec(),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn recognize(&self, _request: &RecognitionRequest) -> Result<Vec<RecognitionResult>> {
        *self.calls.lock().unwrap() += 1;
        let words: Vec<WordInfo> = self
            .words
            .iter()
            .map(|(word, speaker)| WordInfo::new(*word, *speaker))
            .collect();
        let transcript = self
            .words
            .iter()
            .map(|(word, _)| *word)
            .collect::<Vec<_>>()
            .join(" ");

        Ok(vec![RecognitionResult {
            alternatives: vec![RecognitionAlternative {
                transcript,
                confidence: 0.9,
                words,
            }],
        }])
    }
}
