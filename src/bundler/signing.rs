//! Signing coordination for built installers.
//!
//! The signer is an external service and is treated as a single shared
//! resource: submissions queue on one slot instead of bursting against it,
//! and a given output path can only have one submission outstanding.
//! Transient failures are retried a bounded number of times with a fixed
//! delay; the whole exchange for one artifact runs under a deadline.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, Semaphore};

use crate::bundler::codec::run_stage;
use crate::bundler::error::{Error, ErrorExt, Result};
use crate::bundler::resource::UnsignedInstaller;
use crate::bundler::settings::{
    DEFAULT_SIGNING_TIMEOUT_SECS, SigningSettings, resolve_tool,
};

/// The finished installer at its published path.
#[derive(Debug)]
pub struct SignedInstaller {
    path: PathBuf,
}

impl SignedInstaller {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the installer.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One submission to the external signer.
///
/// Reads the artifact at `source` and writes the signed replacement to
/// `target`. Implementations block; the coordinator runs them off the
/// async runtime.
pub trait SigningTransport: Send + Sync {
    /// Submits `source` and writes the signed artifact to `target`.
    fn sign(&self, source: &Path, target: &Path) -> Result<()>;
}

/// Transport invoking the configured signing command.
///
/// The command receives its configured arguments followed by the source
/// and target paths.
pub struct CommandSigner {
    command: PathBuf,
    args: Vec<String>,
}

impl CommandSigner {
    /// Resolves the configured signing command.
    pub fn from_settings(settings: &SigningSettings) -> Result<Self> {
        Ok(Self {
            command: resolve_tool(&settings.command)?,
            args: settings.args.clone(),
        })
    }

    fn sign_command(&self, source: &Path, target: &Path) -> Command {
        let mut command = Command::new(&self.command);
        command.args(&self.args).arg(source).arg(target);
        command
    }
}

impl SigningTransport for CommandSigner {
    fn sign(&self, source: &Path, target: &Path) -> Result<()> {
        run_stage(self.sign_command(source, target), "sign")
    }
}

/// Submits installers to the signer and publishes the results.
pub struct SigningCoordinator {
    transport: Option<Arc<dyn SigningTransport>>,
    attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
    allow_list: Option<Vec<String>>,
    signer_slot: Semaphore,
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl SigningCoordinator {
    /// Creates a coordinator for the given transport and policy.
    ///
    /// Without a transport every artifact passes through unsigned, which
    /// is how unofficial builds run.
    pub fn new(transport: Option<Arc<dyn SigningTransport>>, policy: Option<&SigningSettings>) -> Self {
        let (attempts, retry_delay, timeout, allow_list) = match policy {
            Some(policy) => (
                policy.attempts.max(1),
                policy.retry_delay(),
                policy.timeout(),
                policy.allow_list.clone(),
            ),
            None => (
                1,
                Duration::ZERO,
                Duration::from_secs(DEFAULT_SIGNING_TIMEOUT_SECS),
                None,
            ),
        };
        Self {
            transport,
            attempts,
            retry_delay,
            timeout,
            allow_list,
            signer_slot: Semaphore::new(1),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Signs one installer and places the result at `target`.
    ///
    /// Artifacts outside the allow list are copied to `target` unsigned.
    /// The signed intermediate is written into the work directory before
    /// being published, so a failed publish never leaves a half-written
    /// installer at the target path.
    pub async fn sign(
        &self,
        unsigned: UnsignedInstaller,
        work_dir: &Path,
        target: &Path,
    ) -> Result<SignedInstaller> {
        let target_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::GenericError(format!("signing target {} has no name", target.display()))
            })?;

        let Some(transport) = self.transport.as_ref().filter(|_| self.is_allowed(&target_name))
        else {
            debug!("passing {target_name} through unsigned");
            tokio::fs::copy(unsigned.path(), target)
                .await
                .fs_context("publishing unsigned installer", target)?;
            return Ok(SignedInstaller::new(target.to_path_buf()));
        };

        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(target.to_path_buf()) {
                return Err(Error::GenericError(format!(
                    "duplicate signing submission for {target_name}"
                )));
            }
        }

        let outcome = self
            .submit(transport, unsigned.path(), work_dir, target, &target_name)
            .await;
        self.in_flight.lock().await.remove(target);
        outcome?;

        info!("signed {}", target.display());
        Ok(SignedInstaller::new(target.to_path_buf()))
    }

    async fn submit(
        &self,
        transport: &Arc<dyn SigningTransport>,
        source: &Path,
        work_dir: &Path,
        target: &Path,
        target_name: &str,
    ) -> Result<()> {
        let _slot = self
            .signer_slot
            .acquire()
            .await
            .map_err(|_| Error::GenericError("signer queue is closed".into()))?;

        let intermediate = work_dir.join(format!("authenticode_{target_name}"));
        let attempts_made = AtomicU32::new(0);
        match tokio::time::timeout(
            self.timeout,
            self.attempt_signing(transport, source, &intermediate, target_name, &attempts_made),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::SigningFailure {
                    target: target_name.to_string(),
                    attempts: attempts_made.load(Ordering::SeqCst),
                    last_error: Box::new(Error::GenericError(format!(
                        "signer did not complete within {}s",
                        self.timeout.as_secs()
                    ))),
                });
            }
        }

        tokio::fs::copy(&intermediate, target)
            .await
            .fs_context("publishing signed installer", target)?;
        Ok(())
    }

    async fn attempt_signing(
        &self,
        transport: &Arc<dyn SigningTransport>,
        source: &Path,
        intermediate: &Path,
        target_name: &str,
        attempts_made: &AtomicU32,
    ) -> Result<()> {
        let mut attempt = 1;
        loop {
            attempts_made.store(attempt, Ordering::SeqCst);
            let transport = Arc::clone(transport);
            let (submit_source, submit_target) = (source.to_path_buf(), intermediate.to_path_buf());
            let outcome =
                tokio::task::spawn_blocking(move || transport.sign(&submit_source, &submit_target))
                    .await
                    .map_err(|e| Error::GenericError(format!("signing task failed: {e}")))?;
            match outcome {
                Ok(()) => return Ok(()),
                Err(error) if attempt < self.attempts => {
                    warn!(
                        "signing {target_name} attempt {attempt} of {} failed: {error}",
                        self.attempts
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    return Err(Error::SigningFailure {
                        target: target_name.to_string(),
                        attempts: attempt,
                        last_error: Box::new(error),
                    });
                }
            }
        }
    }

    fn is_allowed(&self, file_name: &str) -> bool {
        match &self.allow_list {
            Some(names) => names.iter().any(|n| n.eq_ignore_ascii_case(file_name)),
            None => true,
        }
    }
}
