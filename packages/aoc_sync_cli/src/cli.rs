use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tracing::{debug, info};

use aoc_sync::transport::Connector;
use aoc_sync::{
    AggregateState, AutomationServer, ConnectionKey, ConnectionState, MqttConnector, SyncConfig,
    SyncService, TokenData,
};

use crate::Target;

const CONNECTION_POLL: Duration = Duration::from_millis(100);

/// A started service with every token reconciled.
pub struct Session {
    service: SyncService,
    connect_timeout: Duration,
}

impl Session {
    pub async fn open(config: SyncConfig, tokens: &[TokenData], servers: Vec<AutomationServer>) -> Self {
        Self::with_connector(config, Arc::new(MqttConnector), tokens, servers).await
    }

    pub async fn with_connector(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        tokens: &[TokenData],
        servers: Vec<AutomationServer>,
    ) -> Self {
        let connect_timeout = config.broker.connect_timeout;
        let service = SyncService::new(config, connector);
        service.set_automation_servers(servers);
        service.start();
        let opened = service.reconcile(tokens).await;
        debug!(opened, "session opened");
        Self {
            service,
            connect_timeout,
        }
    }

    pub async fn close(&self) {
        self.service.stop().await;
    }

    /// Wait until every connection has left `Connecting`.
    async fn settle(&self) {
        let deadline = tokio::time::Instant::now() + self.connect_timeout + CONNECTION_POLL;
        while tokio::time::Instant::now() < deadline {
            let connections = self.service.connections().await;
            if connections
                .iter()
                .all(|c| c.state != ConnectionState::Connecting)
            {
                return;
            }
            tokio::time::sleep(CONNECTION_POLL).await;
        }
    }

    /// Wait for the target's connection and fail unless it is ready.
    async fn ready(&self, target: &Target) -> Result<ConnectionKey> {
        let key = target.key();
        self.settle().await;
        let state = self
            .service
            .connections()
            .await
            .into_iter()
            .find(|c| c.key == key)
            .map(|c| c.state);
        match state {
            Some(ConnectionState::Ready) => Ok(key),
            Some(ConnectionState::Failed { reason }) => {
                bail!("Connection to {key} failed: {reason}")
            }
            Some(other) => bail!("Connection to {key} is not ready ({})", state_label(&other)),
            None => bail!("No broker token for {key}"),
        }
    }
}

pub async fn watch_command(session: &Session, json: bool) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = session.service.add_listener(move || {
        let _ = tx.send(());
    });

    print_state(&session.service.state(), json)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for ctrl-c")?;
                info!("stopping watch");
                return Ok(());
            }
            changed = rx.recv() => {
                if changed.is_none() {
                    return Ok(());
                }
                // Coalesce bursts into one print.
                while rx.try_recv().is_ok() {}
                print_state(&session.service.state(), json)?;
            }
        }
    }
}

fn print_state(state: &AggregateState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(state)?);
    } else {
        for line in summarize(state) {
            println!("{line}");
        }
    }
    Ok(())
}

/// Human-readable summary of an aggregate, one line per server.
fn summarize(state: &AggregateState) -> Vec<String> {
    if state.is_loading {
        return vec!["Loading...".to_string()];
    }

    let mut lines: Vec<String> = state
        .servers_by_id
        .values()
        .map(|server| {
            let processes: usize = server
                .workspaces
                .values()
                .map(|w| w.processes.len())
                .sum();
            format!(
                "{:<24} {:>3} workspace(s) {:>4} pipeline(s) {:>4} process(es)",
                server.name,
                server.workspaces.len(),
                server.pipelines.len(),
                processes
            )
        })
        .collect();

    let unassigned = state
        .unassigned()
        .map(|p| p.automation_sources.len())
        .unwrap_or(0);
    lines.push(format!(
        "{} pipeline(s), {} process(es), {} unassigned",
        state.all_pipelines.len(),
        state.processes().count(),
        unassigned
    ));
    lines
}

pub async fn connections_command(session: &Session, json: bool) -> Result<()> {
    session.settle().await;
    let connections = session.service.connections().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&connections)?);
    } else if connections.is_empty() {
        println!("No connections.");
    } else {
        println!("{:<40} {:<12} {}", "WORKSPACE", "STATE", "DETAIL");
        println!("{}", "-".repeat(72));
        for connection in &connections {
            let detail = match &connection.state {
                ConnectionState::Failed { reason } => reason.as_str(),
                _ => "",
            };
            println!(
                "{:<40} {:<12} {}",
                connection.key.to_string(),
                state_label(&connection.state),
                detail
            );
        }
        println!("\n{} connection(s)", connections.len());
    }

    Ok(())
}

fn state_label(state: &ConnectionState) -> &'static str {
    match state {
        ConnectionState::Connecting => "connecting",
        ConnectionState::Ready => "ready",
        ConnectionState::Closed => "closed",
        ConnectionState::Failed { .. } => "failed",
    }
}

pub async fn content_get_command(session: &Session, target: &Target, process: &str) -> Result<()> {
    let key = session.ready(target).await?;
    let content = session
        .service
        .get_process_content(&key, process)
        .await
        .with_context(|| format!("Failed to fetch process {process}"))?;
    print!("{content}");
    Ok(())
}

pub async fn content_set_command(
    session: &Session,
    target: &Target,
    process: &str,
    file: &Path,
) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let key = session.ready(target).await?;
    session
        .service
        .set_process_content(&key, process, &content)
        .await
        .with_context(|| format!("Failed to save process {process}"))?;
    println!("Saved process {process}.");
    Ok(())
}

pub async fn attachment_get_command(
    session: &Session,
    target: &Target,
    process: &str,
    name: &str,
    out: Option<PathBuf>,
) -> Result<()> {
    let key = session.ready(target).await?;
    let attachment = session
        .service
        .get_process_attachment(&key, process, name)
        .await
        .with_context(|| format!("Failed to fetch attachment {name}"))?;
    let out = out.unwrap_or_else(|| PathBuf::from(&attachment.file_name));
    tokio::fs::write(&out, &attachment.data)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;
    println!("Wrote {} bytes to {}.", attachment.data.len(), out.display());
    Ok(())
}

pub async fn attachment_put_command(
    session: &Session,
    target: &Target,
    process: &str,
    file: &Path,
) -> Result<()> {
    let key = session.ready(target).await?;
    let name = session
        .service
        .upload_process_attachment(&key, process, file)
        .await
        .with_context(|| format!("Failed to upload {}", file.display()))?;
    println!("Uploaded {name}.");
    Ok(())
}

pub async fn attachment_delete_command(
    session: &Session,
    target: &Target,
    process: &str,
    name: &str,
) -> Result<()> {
    let key = session.ready(target).await?;
    session
        .service
        .delete_process_attachment(&key, process, name)
        .await
        .with_context(|| format!("Failed to delete attachment {name}"))?;
    println!("Deleted {name}.");
    Ok(())
}

pub async fn process_create_command(session: &Session, target: &Target, name: &str) -> Result<()> {
    let key = session.ready(target).await?;
    let id = session
        .service
        .create_process(&key, name)
        .await
        .context("Failed to create process")?;
    println!("{id}");
    Ok(())
}

pub async fn process_delete_command(session: &Session, target: &Target, process: &str) -> Result<()> {
    let key = session.ready(target).await?;
    session
        .service
        .delete_process(&key, process)
        .await
        .with_context(|| format!("Failed to delete process {process}"))?;
    println!("Requested deletion of {process}.");
    Ok(())
}
