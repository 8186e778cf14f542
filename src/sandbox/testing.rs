//! Recording in-memory runtime for unit tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::sandbox::error::{Result, SandboxError};
use crate::sandbox::runtime::{ContainerRuntime, ContainerSpec};

/// Scripted behaviour plus a log of every call.
pub(crate) struct MockRuntime {
    pub images: Mutex<HashSet<String>>,
    pub pull_count: AtomicUsize,
    pub pull_delay: Duration,
    pub pull_fails: bool,
    pub create_fails: bool,
    pub start_fails: bool,
    pub remove_fails: bool,
    pub exit_code: i64,
    pub output: String,
    pub run_time: Duration,
    pub created: Mutex<Vec<ContainerSpec>>,
    pub live: Mutex<HashSet<String>>,
    /// Most containers alive at the same time.
    pub max_live: AtomicUsize,
    pub killed: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            images: Mutex::new(HashSet::new()),
            pull_count: AtomicUsize::new(0),
            pull_delay: Duration::ZERO,
            pull_fails: false,
            create_fails: false,
            start_fails: false,
            remove_fails: false,
            exit_code: 0,
            output: String::new(),
            run_time: Duration::ZERO,
            created: Mutex::new(Vec::new()),
            live: Mutex::new(HashSet::new()),
            max_live: AtomicUsize::new(0),
            killed: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_image(self, image: &str) -> Self {
        self.images.lock().unwrap().insert(image.to_string());
        self
    }

    pub fn with_result(mut self, exit_code: i64, output: &str) -> Self {
        self.exit_code = exit_code;
        self.output = output.to_string();
        self
    }

    pub fn pulls(&self) -> usize {
        self.pull_count.load(Ordering::SeqCst)
    }

    pub fn live_containers(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn peak_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> ContainerSpec {
        self.created.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.pull_count.fetch_add(1, Ordering::SeqCst);
        if !self.pull_delay.is_zero() {
            tokio::time::sleep(self.pull_delay).await;
        }
        if self.pull_fails {
            return Err(SandboxError::ImageUnavailable {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        self.images.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        if self.create_fails {
            return Err(SandboxError::ContainerSetup {
                reason: "Minimum memory limit allowed is 6MB".to_string(),
            });
        }
        self.created.lock().unwrap().push(spec.clone());
        let mut live = self.live.lock().unwrap();
        live.insert(spec.name.clone());
        self.max_live.fetch_max(live.len(), Ordering::SeqCst);
        Ok(spec.name.clone())
    }

    async fn start_container(&self, _id: &str) -> Result<()> {
        if self.start_fails {
            return Err(SandboxError::ContainerRuntime {
                reason: "exec: \"bash\": executable file not found".to_string(),
            });
        }
        Ok(())
    }

    async fn wait_container(&self, _id: &str) -> Result<i64> {
        if !self.run_time.is_zero() {
            tokio::time::sleep(self.run_time).await;
        }
        Ok(self.exit_code)
    }

    async fn logs(&self, _id: &str) -> Result<String> {
        Ok(self.output.clone())
    }

    async fn kill_container(&self, id: &str) -> Result<()> {
        self.killed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        if self.remove_fails {
            return Err(SandboxError::ContainerRuntime {
                reason: "removal of container is already in progress".to_string(),
            });
        }
        self.live.lock().unwrap().remove(id);
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }
}
