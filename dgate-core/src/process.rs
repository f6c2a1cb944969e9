//! Supervisor for the external generator subprocess.
//!
//! The generator is a JVM program launched under `numactl` with a fixed
//! argument vector: NUMA pinning, heap sizing, system properties, and the
//! data-generation options. The whole command line is built in one place so
//! deployments and tests can inspect it before anything is spawned.

use std::path::PathBuf;
use std::process::{Child, Command};

use crate::error::{DgateError, Result};

/// Launch configuration for the generator.
///
/// The defaults reproduce the deployment command line; tests and unusual
/// installations override individual fields.
#[derive(Debug, Clone)]
pub struct PdgfOptions {
    /// Working directory of the child; config files and the generation
    /// library are resolved relative to it.
    pub install_root: PathBuf,

    /// `numactl` binary used for NUMA pinning, or `None` to execute the JVM
    /// directly.
    pub numactl: Option<PathBuf>,

    /// NUMA node the generator's CPUs and memory are bound to.
    pub numa_node: u32,

    /// Java binary.
    pub java: PathBuf,

    /// JVM options (heap sizing, TLAB tuning).
    pub jvm_options: Vec<String>,

    /// System properties passed as `-Dkey=value`, in order.
    pub system_properties: Vec<(String, String)>,

    /// Generator jar, relative to the install root.
    pub jar: String,

    /// Schema configuration file loaded by the generator.
    pub schema_config: String,

    /// Streaming (output plugin) configuration file.
    pub generation_config: String,

    /// Scale factor of the generated data set.
    pub scale_factor: String,

    /// Generator worker thread count.
    pub workers: u32,
}

impl Default for PdgfOptions {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from("../../pdgf"),
            numactl: Some(PathBuf::from("/usr/bin/numactl")),
            numa_node: 0,
            java: PathBuf::from("java"),
            jvm_options: vec![
                "-Xms20g".into(),
                "-Xmx20g".into(),
                "-XX:TLABSize=4000k".into(),
            ],
            system_properties: vec![
                ("java.library.path".into(), "extlib/".into()),
                (
                    "CONCURRENT_SCHED_DEFAULT_WORKUNIT_SIZE".into(),
                    crate::shm::DEFAULT_WORK_UNIT_SIZE.to_string(),
                ),
            ],
            jar: "pdgf.jar".into(),
            schema_config: "pdgf-schema.xml".into(),
            generation_config: "shm-generation.xml".into(),
            scale_factor: "1".into(),
            workers: 1,
        }
    }
}

impl PdgfOptions {
    /// The full command line, program first.
    ///
    /// Kept deterministic and side-effect free so tests can assert on the
    /// exact argument vector.
    pub fn command_line(&self) -> Vec<String> {
        let mut line = Vec::new();

        if let Some(numactl) = &self.numactl {
            line.push(numactl.display().to_string());
            line.push("-N".into());
            line.push(self.numa_node.to_string());
            line.push("-m".into());
            line.push(self.numa_node.to_string());
        }

        line.push(self.java.display().to_string());
        line.extend(self.jvm_options.iter().cloned());
        for (key, value) in &self.system_properties {
            line.push(format!("-D{key}={value}"));
        }
        line.push("-jar".into());
        line.push(self.jar.clone());

        line.push("-load".into());
        line.push(self.schema_config.clone());
        line.push("-load".into());
        line.push(self.generation_config.clone());
        line.push("-noShell".into());
        line.push("-closeWhenDone".into());
        line.push("-sf".into());
        line.push(self.scale_factor.clone());
        line.push("-workers".into());
        line.push(self.workers.to_string());
        line.push("-start".into());

        line
    }
}

/// A running (or reaped) generator subprocess.
///
/// Dropping the supervisor kills and collects a child that is still
/// running, so abort paths never leak the process.
#[derive(Debug)]
pub struct PdgfProcess {
    options: PdgfOptions,
    child: Option<Child>,
}

impl PdgfProcess {
    /// Spawns the generator with `options`.
    ///
    /// The reader must have created the shared resources before this is
    /// called; the generator binds to them at startup.
    pub fn launch(options: PdgfOptions) -> Result<Self> {
        let line = options.command_line();
        tracing::info!(command = %line.join(" "), root = %options.install_root.display(), "launching generator");

        let child = Command::new(&line[0])
            .args(&line[1..])
            .current_dir(&options.install_root)
            .spawn()
            .map_err(|source| DgateError::Resource {
                op: "spawn generator",
                source,
            })?;

        Ok(Self {
            options,
            child: Some(child),
        })
    }

    /// The options this process was launched with.
    pub fn options(&self) -> &PdgfOptions {
        &self.options
    }

    /// Blocks until the generator exits and returns its exit code, or
    /// `None` if it was killed by a signal or already collected.
    ///
    /// A non-zero code after a fully drained stream is reported but not
    /// turned into an error here; that policy belongs to the caller.
    pub fn wait(&mut self) -> Result<Option<i32>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        let status = child.wait().map_err(|source| DgateError::Resource {
            op: "wait for generator",
            source,
        })?;
        self.child = None;

        let code = status.code();
        if status.success() {
            tracing::info!("generator exited cleanly");
        } else {
            tracing::warn!(?code, "generator exited with failure status");
        }
        Ok(code)
    }

    /// Polls the generator without blocking; `Some(code)` once it exited.
    pub fn try_wait(&mut self) -> Result<Option<Option<i32>>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(Some(None));
        };
        let status = child.try_wait().map_err(|source| DgateError::Resource {
            op: "poll generator",
            source,
        })?;
        match status {
            Some(status) => {
                self.child = None;
                Ok(Some(status.code()))
            }
            None => Ok(None),
        }
    }

    /// Fails if the generator exited while cells were still expected.
    pub fn ensure_running(&mut self) -> Result<()> {
        match self.try_wait()? {
            Some(code) => Err(DgateError::ProducerExit { code }),
            None => Ok(()),
        }
    }
}

impl Drop for PdgfProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            tracing::warn!("killing generator still running at supervisor drop");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
