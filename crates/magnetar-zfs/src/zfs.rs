use crate::command::zfs;
use crate::error::{Result, ZfsError};
use crate::provider::{Dataset, DatasetKind, DatasetOptions, DatasetProvider};
use async_trait::async_trait;
use std::io::{Read, Write};
use std::process::Stdio;
use tracing::info;

const LIST_COLUMNS: &str = "name,type,volsize,written,avail,quota";

/// ZFS-backed dataset provider
///
/// Shells out to the `zfs` CLI. All failures are classified into
/// `ZfsErrorKind` from stderr here, in one place.
pub struct ZfsProvider;

impl ZfsProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ZfsProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a numeric property column; `-` means the property does not apply
fn parse_prop(field: &str) -> u64 {
    if field == "-" || field == "none" {
        0
    } else {
        field.parse().unwrap_or(0)
    }
}

/// Parse one line of `zfs list -H -p -o name,type,volsize,written,avail,quota`
fn parse_list_line(line: &str) -> Result<Dataset> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 6 {
        return Err(ZfsError::command_failed(format!(
            "unexpected zfs list output: {}",
            line
        )));
    }
    let kind = DatasetKind::parse(fields[1]).ok_or_else(|| {
        ZfsError::command_failed(format!("unknown dataset type '{}': {}", fields[1], line))
    })?;
    Ok(Dataset {
        name: fields[0].to_string(),
        kind,
        volsize: parse_prop(fields[2]),
        written: parse_prop(fields[3]),
        avail: parse_prop(fields[4]),
        quota: parse_prop(fields[5]),
    })
}

fn parse_list_output(stdout: &str) -> Result<Vec<Dataset>> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(parse_list_line)
        .collect()
}

/// Render `-o key=value` argument pairs for dataset creation
fn property_args(opts: &DatasetOptions) -> Vec<String> {
    let mut args = Vec::with_capacity(opts.len() * 2);
    for (key, value) in opts {
        args.push("-o".to_string());
        args.push(format!("{}={}", key, value));
    }
    args
}

async fn list(type_arg: &str, target: &str, recursive: bool) -> Result<Vec<Dataset>> {
    let mut args = vec!["list", "-H", "-p", "-t", type_arg, "-o", LIST_COLUMNS];
    if recursive {
        args.push("-r");
    }
    args.push(target);
    let stdout = zfs(&args).await?;
    parse_list_output(&stdout)
}

#[async_trait]
impl DatasetProvider for ZfsProvider {
    async fn get_dataset(&self, name: &str) -> Result<Dataset> {
        let datasets = list("all", name, false).await?;
        datasets
            .into_iter()
            .next()
            .ok_or_else(|| ZfsError::not_found(name))
    }

    async fn create_filesystem(&self, name: &str, opts: &DatasetOptions) -> Result<Dataset> {
        let props = property_args(opts);
        let mut args = vec!["create", "-p"];
        args.extend(props.iter().map(String::as_str));
        args.push(name);
        zfs(&args).await?;
        info!("Created filesystem dataset: {}", name);
        self.get_dataset(name).await
    }

    async fn create_volume(&self, name: &str, size: u64, opts: &DatasetOptions) -> Result<Dataset> {
        let size_arg = size.to_string();
        let props = property_args(opts);
        let mut args = vec!["create", "-p", "-V", size_arg.as_str()];
        args.extend(props.iter().map(String::as_str));
        args.push(name);
        zfs(&args).await?;
        info!("Created volume: {} ({} bytes)", name, size);
        self.get_dataset(name).await
    }

    async fn volumes(&self, prefix: &str) -> Result<Vec<Dataset>> {
        list("volume", prefix, true).await
    }

    async fn datasets(&self, prefix: &str) -> Result<Vec<Dataset>> {
        list("all", prefix, true).await
    }

    async fn snapshots(&self, prefix: &str) -> Result<Vec<Dataset>> {
        list("snapshot", prefix, true).await
    }

    async fn snapshot(&self, name: &str, tag: &str, recursive: bool) -> Result<Dataset> {
        let snap_name = format!("{}@{}", name, tag);
        let mut args = vec!["snapshot"];
        if recursive {
            args.push("-r");
        }
        args.push(&snap_name);
        zfs(&args).await?;
        info!("Created snapshot: {}", snap_name);
        self.get_dataset(&snap_name).await
    }

    async fn clone_snapshot(
        &self,
        snapshot: &str,
        dest: &str,
        opts: &DatasetOptions,
    ) -> Result<Dataset> {
        let props = property_args(opts);
        let mut args = vec!["clone", "-p"];
        args.extend(props.iter().map(String::as_str));
        args.push(snapshot);
        args.push(dest);
        zfs(&args).await?;
        info!("Cloned {} to {}", snapshot, dest);
        self.get_dataset(dest).await
    }

    async fn destroy(&self, name: &str, recursive: bool) -> Result<()> {
        let mut args = vec!["destroy"];
        if recursive {
            args.push("-r");
        }
        args.push(name);
        zfs(&args).await?;
        info!("Destroyed dataset: {}", name);
        Ok(())
    }

    async fn rollback(&self, snapshot: &str, destroy_more_recent: bool) -> Result<()> {
        let mut args = vec!["rollback"];
        if destroy_more_recent {
            args.push("-r");
        }
        args.push(snapshot);
        zfs(&args).await?;
        info!("Rolled back to snapshot: {}", snapshot);
        Ok(())
    }

    async fn send_snapshot(&self, snapshot: &str, mut writer: Box<dyn Write + Send>) -> Result<()> {
        let snapshot = snapshot.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut child = std::process::Command::new("zfs")
                .args(["send", &snapshot])
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            let mut stdout = child
                .stdout
                .take()
                .ok_or_else(|| ZfsError::io("zfs send produced no stdout pipe"))?;
            let copied = std::io::copy(&mut stdout, &mut writer);
            let output = child.wait_with_output()?;
            if !output.status.success() {
                return Err(ZfsError::from_stderr(&String::from_utf8_lossy(
                    &output.stderr,
                )));
            }
            copied?;
            writer.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| ZfsError::io(format!("send task failed: {}", e)))?
    }

    async fn receive_snapshot(&self, mut reader: Box<dyn Read + Send>, dest: &str) -> Result<Dataset> {
        let dest_name = dest.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut child = std::process::Command::new("zfs")
                .args(["receive", &dest_name])
                .stdin(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| ZfsError::io("zfs receive produced no stdin pipe"))?;
            let copied = std::io::copy(&mut reader, &mut stdin);
            drop(stdin);
            let output = child.wait_with_output()?;
            if !output.status.success() {
                return Err(ZfsError::from_stderr(&String::from_utf8_lossy(
                    &output.stderr,
                )));
            }
            copied?;
            Ok(())
        })
        .await
        .map_err(|e| ZfsError::io(format!("receive task failed: {}", e)))??;

        info!("Received snapshot stream into: {}", dest);
        self.get_dataset(dest).await
    }
}
