//! File transfer to and from test nodes

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};
use crate::process::ProcessHandle;
use crate::services::{LocalChannel, SshChannel};
use crate::traits::{CommandChannel, CommandSpec, FileChannel};

/// Reads and writes files on this machine; the host argument is informational
#[derive(Debug, Default, Clone)]
pub struct LocalFileChannel;

impl LocalFileChannel {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileChannel for LocalFileChannel {
    async fn put_file(&self, _host: &str, data: &[u8], path: &str) -> HarnessResult<()> {
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn get_file(&self, _host: &str, path: &str) -> HarnessResult<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn delete_file(&self, _host: &str, path: &str) -> HarnessResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Copies files with `scp`, staging through a local temporary file
#[derive(Debug, Clone)]
pub struct ScpFileChannel {
    scp_program: String,
    local: Arc<dyn CommandChannel>,
    remote: Arc<dyn CommandChannel>,
}

impl Default for ScpFileChannel {
    fn default() -> Self {
        Self {
            scp_program: "scp".to_string(),
            local: Arc::new(LocalChannel::new()),
            remote: Arc::new(SshChannel::new()),
        }
    }
}

impl ScpFileChannel {
    pub fn new() -> Self {
        Self::default()
    }

    async fn scp(&self, from: &str, to: &str) -> HarnessResult<()> {
        let argv = vec![
            self.scp_program.clone(),
            "-q".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            from.to_string(),
            to.to_string(),
        ];
        let output = ProcessHandle::run(self.local.clone(), CommandSpec::new("localhost", argv), None).await?;
        if output.exit_code != Some(0) {
            return Err(HarnessError::fixture(format!(
                "copying {from} to {to} failed ({:?}): {}",
                output.exit_code, output.stderr
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl FileChannel for ScpFileChannel {
    async fn put_file(&self, host: &str, data: &[u8], path: &str) -> HarnessResult<()> {
        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(data)?;
        staged.flush()?;

        let source = staged.path().display().to_string();
        debug!("sending file {} to host {}: {}", source, host, path);
        self.scp(&source, &format!("{host}:{path}")).await
    }

    async fn get_file(&self, host: &str, path: &str) -> HarnessResult<Vec<u8>> {
        let staged = tempfile::NamedTempFile::new()?;
        let target = staged.path().display().to_string();

        debug!("downloading file {} on host {} to {}", path, host, target);
        self.scp(&format!("{host}:{path}"), &target).await?;
        Ok(tokio::fs::read(staged.path()).await?)
    }

    async fn delete_file(&self, host: &str, path: &str) -> HarnessResult<()> {
        let argv = vec!["rm".to_string(), "-f".to_string(), path.to_string()];
        let output = ProcessHandle::run(self.remote.clone(), CommandSpec::new(host, argv), None).await?;
        if output.exit_code != Some(0) {
            return Err(HarnessError::fixture(format!(
                "deleting {path} on {host} failed: {}",
                output.stderr
            )));
        }
        Ok(())
    }
}
