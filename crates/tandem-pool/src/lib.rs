//! Reviewer subprocess pool.
//!
//! Owns the full lifecycle of broker-managed reviewer processes: spawn,
//! drain, terminate, reactive and periodic scaling, claim-timeout reclaim
//! with fencing, and the startup ownership sweep. Reviewers are launched via
//! an argument list (never a shell string) with the prompt written to
//! stdin and stdout/stderr detached to the null device.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

use tandem_broker::{BrokerCtx, PoolSignal};
use tandem_config::{PoolConfig, ENV_CODEX_BIN, ENV_REVIEWER_PROMPT, ENV_WSL_DISTRO};
use tandem_db as db;
use tandem_schemas::events;

/// Grace period between the stop request and the hard kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);
/// Shorter grace used during broker teardown so shutdown stays bounded.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Reactive scale-up threshold: pending reviews per active reviewer.
const SCALE_RATIO: i64 = 3;

struct ReviewerHandle {
    child: Child,
    spawned_at: Instant,
}

#[derive(Default)]
struct PoolInner {
    live: HashMap<String, ReviewerHandle>,
    draining: HashSet<String>,
    counter: u32,
    last_spawn: Option<Instant>,
    last_kill: Option<Instant>,
}

pub struct ReviewerPool {
    ctx: Arc<BrokerCtx>,
    cfg: PoolConfig,
    session_token: String,
    broker_url: String,
    prompt_template: String,
    /// Serializes every scale decision so concurrent triggers cannot push
    /// the pool past `max_pool_size`.
    spawn_lock: Mutex<()>,
    inner: Mutex<PoolInner>,
    shutdown_tx: watch::Sender<bool>,
}

/// Per-broker-session token: 8 hex chars distinguishing this run's reviewers
/// from rows left behind by previous sessions.
pub fn new_session_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Load the reviewer prompt template from disk.
///
/// Path: `TANDEM_REVIEWER_PROMPT`, or `reviewer_prompt.txt` next to the
/// broker binary. Both placeholders must be present or startup fails.
pub fn load_prompt_template() -> Result<String> {
    let path = match std::env::var(ENV_REVIEWER_PROMPT) {
        Ok(p) => PathBuf::from(p),
        Err(_) => std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join("reviewer_prompt.txt")))
            .unwrap_or_else(|| PathBuf::from("reviewer_prompt.txt")),
    };
    let template = std::fs::read_to_string(&path)
        .with_context(|| format!("read reviewer prompt template {:?}", path))?;
    check_template(&template)?;
    Ok(template)
}

fn check_template(template: &str) -> Result<()> {
    for placeholder in ["{reviewer_id}", "{broker_url}"] {
        if !template.contains(placeholder) {
            return Err(anyhow!(
                "reviewer prompt template missing required placeholder {}",
                placeholder
            ));
        }
    }
    Ok(())
}

fn render_prompt(template: &str, reviewer_id: &str, broker_url: &str) -> String {
    template
        .replace("{reviewer_id}", reviewer_id)
        .replace("{broker_url}", broker_url)
}

/// Full argv for one reviewer launch. On Windows the same command line runs
/// inside WSL.
pub fn build_argv(cfg: &PoolConfig, workspace: &std::path::Path) -> Vec<String> {
    let bin = std::env::var(ENV_CODEX_BIN).unwrap_or_else(|_| "codex".to_string());

    let mut argv: Vec<String> = Vec::new();
    if cfg!(windows) {
        let distro = std::env::var(ENV_WSL_DISTRO).unwrap_or_else(|_| "Ubuntu".to_string());
        argv.extend(["wsl".to_string(), "-d".to_string(), distro, "--".to_string()]);
    }
    argv.extend([
        bin,
        "exec".to_string(),
        "--sandbox".to_string(),
        "read-only".to_string(),
        "--ephemeral".to_string(),
        "--model".to_string(),
        cfg.model.clone(),
        "-c".to_string(),
        format!("model_reasoning_effort={}", cfg.reasoning_effort),
        "-C".to_string(),
        workspace.to_string_lossy().to_string(),
        "-".to_string(),
    ]);
    argv
}

impl ReviewerPool {
    /// Build the pool. The prompt template is passed in already loaded so
    /// the daemon fails startup before anything else is wired.
    pub fn new(
        ctx: Arc<BrokerCtx>,
        cfg: PoolConfig,
        session_token: String,
        broker_url: String,
        prompt_template: String,
    ) -> Result<Arc<Self>> {
        tandem_config::validate_pool(&cfg)?;
        check_template(&prompt_template)?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            ctx,
            cfg,
            session_token,
            broker_url,
            prompt_template,
            spawn_lock: Mutex::new(()),
            inner: Mutex::new(PoolInner::default()),
            shutdown_tx,
        }))
    }

    pub fn session_token(&self) -> &str {
        &self.session_token
    }

    /// Startup recovery: terminate previous-session reviewer rows, then
    /// reclaim every review still claimed by a reviewer that is not in this
    /// session's live set (at startup: all of them).
    pub async fn startup_recovery(&self) -> Result<()> {
        let now = db::now_legacy();
        let stale = db::terminate_previous_sessions(&self.ctx.pool, &self.session_token, &now)
            .await?;
        if stale > 0 {
            info!(stale, "terminated previous-session reviewer rows");
        }

        let claimed = db::list_claimed(&self.ctx.pool).await?;
        let live = self.live_ids().await;
        let mut reclaimed = 0usize;
        for review in claimed {
            let holder_live = review
                .claimed_by
                .as_deref()
                .map(|h| live.contains(h))
                .unwrap_or(false);
            if !holder_live {
                if tandem_broker::reclaim_review(&self.ctx, &review.id, "startup ownership sweep")
                    .await?
                {
                    reclaimed += 1;
                }
            }
        }
        if reclaimed > 0 {
            warn!(reclaimed, "startup ownership sweep reclaimed stuck reviews");
        }
        Ok(())
    }

    async fn live_ids(&self) -> HashSet<String> {
        self.inner.lock().await.live.keys().cloned().collect()
    }

    /// Manual spawn (tool surface). Rate-limited by the spawn cooldown.
    pub async fn spawn_reviewer(&self) -> Result<String> {
        let _scale = self.spawn_lock.lock().await;
        self.spawn_locked(true).await
    }

    /// Spawn one reviewer; the caller holds `spawn_lock`.
    async fn spawn_locked(&self, enforce_cooldown: bool) -> Result<String> {
        let (display_name, id) = {
            let mut inner = self.inner.lock().await;

            if inner.live.len() as u32 >= self.cfg.max_pool_size {
                return Err(anyhow!(
                    "reviewer pool at capacity ({})",
                    self.cfg.max_pool_size
                ));
            }
            if enforce_cooldown {
                if let Some(last) = inner.last_spawn {
                    let cooldown = Duration::from_secs(self.cfg.spawn_cooldown_seconds);
                    if last.elapsed() < cooldown {
                        return Err(anyhow!(
                            "spawn rate-limited; retry in {}s",
                            (cooldown - last.elapsed()).as_secs().max(1)
                        ));
                    }
                }
            }

            inner.counter += 1;
            let display_name = format!("codex-r{}", inner.counter);
            let id = format!("{display_name}-{}", self.session_token);
            (display_name, id)
        };

        let workspace = self
            .cfg
            .workspace
            .clone()
            .or_else(|| self.ctx.repo_root.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        let argv = build_argv(&self.cfg, &workspace);
        let prompt = render_prompt(&self.prompt_template, &id, &self.broker_url);

        // Launch outside the write mutex; only the row write is serialized.
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn reviewer {:?}", argv[0]))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("write reviewer prompt to stdin")?;
            // Dropping stdin closes the stream; the reviewer sees EOF.
        }
        let pid = child.id();

        let row = db::NewReviewer {
            id: id.clone(),
            display_name: display_name.clone(),
            session_token: self.session_token.clone(),
            pid: pid.map(|p| p as i64),
            spawned_at: db::now_legacy(),
        };

        let record = async {
            let _guard = self.ctx.write_lock.lock().await;
            let mut tx = db::WriteTx::begin(&self.ctx.pool).await?;
            db::insert_reviewer(tx.conn(), &row).await?;
            db::record_event(
                tx.conn(),
                None,
                events::REVIEWER_SPAWNED,
                &id,
                None,
                None,
                Some(&json!({ "display_name": display_name, "pid": pid })),
            )
            .await?;
            tx.commit().await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = record {
            // No orphans: the row write failed, so the subprocess goes too.
            let _ = child.start_kill();
            return Err(e.context("record reviewer row"));
        }

        let mut inner = self.inner.lock().await;
        inner.live.insert(
            id.clone(),
            ReviewerHandle {
                child,
                spawned_at: Instant::now(),
            },
        );
        inner.last_spawn = Some(Instant::now());
        drop(inner);

        info!(reviewer = %id, pid = ?pid, "reviewer spawned");
        Ok(id)
    }

    /// Manual kill (tool surface). Only broker-spawned ids are eligible.
    pub async fn kill_reviewer(&self, reviewer_id: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if !inner.live.contains_key(reviewer_id) {
                return Err(anyhow!(
                    "unknown reviewer id {} (not managed by this broker session)",
                    reviewer_id
                ));
            }
            if let Some(last) = inner.last_kill {
                let cooldown = Duration::from_secs(self.cfg.spawn_cooldown_seconds);
                if last.elapsed() < cooldown {
                    return Err(anyhow!(
                        "kill rate-limited; retry in {}s",
                        (cooldown - last.elapsed()).as_secs().max(1)
                    ));
                }
            }
            inner.last_kill = Some(Instant::now());
        }
        self.drain(reviewer_id).await
    }

    /// Flag a reviewer as draining; terminate immediately when it holds no
    /// claimed review.
    pub async fn drain(&self, reviewer_id: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if !inner.draining.insert(reviewer_id.to_string()) {
                return Ok(()); // already draining
            }
        }

        db::set_reviewer_status(
            &self.ctx.pool,
            reviewer_id,
            tandem_schemas::ReviewerStatus::Draining,
        )
        .await?;
        {
            let _guard = self.ctx.write_lock.lock().await;
            let mut tx = db::WriteTx::begin(&self.ctx.pool).await?;
            db::record_event(
                tx.conn(),
                None,
                events::REVIEWER_DRAIN_START,
                reviewer_id,
                None,
                None,
                None,
            )
            .await?;
            tx.commit().await?;
        }
        info!(reviewer = reviewer_id, "reviewer draining");

        let open = db::claimed_count_for_reviewer(&self.ctx.pool, reviewer_id).await?;
        if open == 0 {
            self.terminate_reviewer(reviewer_id, TERMINATE_GRACE).await?;
        }
        Ok(())
    }

    /// Stop the subprocess (graceful wait, then hard kill) and stamp the row.
    async fn terminate_reviewer(&self, reviewer_id: &str, grace: Duration) -> Result<()> {
        let handle = {
            let mut inner = self.inner.lock().await;
            inner.draining.remove(reviewer_id);
            inner.live.remove(reviewer_id)
        };

        let exit_code = match handle {
            Some(mut h) => {
                let code = match tokio::time::timeout(grace, h.child.wait()).await {
                    Ok(Ok(status)) => status.code().map(i64::from),
                    Ok(Err(e)) => {
                        warn!(reviewer = reviewer_id, error = %e, "reviewer wait failed");
                        None
                    }
                    Err(_) => {
                        warn!(reviewer = reviewer_id, "grace period expired; killing");
                        let _ = h.child.start_kill();
                        match h.child.wait().await {
                            Ok(status) => status.code().map(i64::from),
                            Err(_) => None,
                        }
                    }
                };
                code
            }
            None => None,
        };

        let now = db::now_legacy();
        db::mark_terminated(&self.ctx.pool, reviewer_id, exit_code, &now).await?;
        {
            let _guard = self.ctx.write_lock.lock().await;
            let mut tx = db::WriteTx::begin(&self.ctx.pool).await?;
            db::record_event(
                tx.conn(),
                None,
                events::REVIEWER_TERMINATED,
                reviewer_id,
                None,
                None,
                Some(&json!({ "exit_code": exit_code })),
            )
            .await?;
            tx.commit().await?;
        }
        info!(reviewer = reviewer_id, exit_code = ?exit_code, "reviewer terminated");
        Ok(())
    }

    /// Reactive trigger from `create_review`: spawn one reviewer when the
    /// pending backlog outruns the active pool more than 3:1.
    async fn maybe_scale_up(&self) -> Result<()> {
        let _scale = self.spawn_lock.lock().await;

        let pending = db::count_by_status(&self.ctx.pool, "pending").await?;
        let (live_count, active) = {
            let inner = self.inner.lock().await;
            let active = inner
                .live
                .keys()
                .filter(|id| !inner.draining.contains(*id))
                .count() as i64;
            (inner.live.len() as u32, active)
        };

        if live_count >= self.cfg.max_pool_size {
            return Ok(());
        }
        if pending <= SCALE_RATIO * active {
            return Ok(());
        }

        match self.spawn_locked(true).await {
            Ok(id) => info!(reviewer = %id, pending, active, "reactive scale-up"),
            // Cooldown and capacity refusals are normal backpressure here.
            Err(e) => tracing::debug!(error = %e, "scale-up skipped"),
        }
        Ok(())
    }

    /// One pass of the periodic maintenance sweep: dead-process reaping,
    /// idle timeout, TTL expiry, claim-timeout reclaim. Driven by the
    /// background timer; public so tests can run a single deterministic pass.
    pub async fn periodic_tick(&self) -> Result<()> {
        // 1. Reap processes that died on their own.
        let dead: Vec<String> = {
            let mut inner = self.inner.lock().await;
            inner
                .live
                .iter_mut()
                .filter_map(|(id, h)| match h.child.try_wait() {
                    Ok(Some(_)) => Some(id.clone()),
                    _ => None,
                })
                .collect()
        };
        for id in dead {
            warn!(reviewer = %id, "reviewer process exited unexpectedly");
            self.terminate_reviewer(&id, Duration::from_millis(100))
                .await?;
        }

        // 2 + 3. Idle timeout and TTL expiry.
        let mut to_drain: Vec<String> = Vec::new();
        {
            let inner = self.inner.lock().await;
            for (id, h) in &inner.live {
                if inner.draining.contains(id) {
                    continue;
                }
                if h.spawned_at.elapsed() >= Duration::from_secs(self.cfg.max_ttl_seconds) {
                    to_drain.push(id.clone());
                }
            }
        }
        for id in &to_drain {
            info!(reviewer = %id, "ttl expired");
        }
        {
            let inner = self.inner.lock().await;
            for (id, _h) in &inner.live {
                if inner.draining.contains(id) || to_drain.contains(id) {
                    continue;
                }
                if let Some(row) = db::fetch_reviewer(&self.ctx.pool, id).await? {
                    let last = row.last_active_at.as_deref().unwrap_or(&row.spawned_at);
                    let idle = db::legacy_age_seconds(last).unwrap_or(0.0);
                    if idle >= self.cfg.idle_timeout_seconds as f64 {
                        let open =
                            db::claimed_count_for_reviewer(&self.ctx.pool, id).await?;
                        if open == 0 {
                            info!(reviewer = %id, idle_seconds = idle as i64, "idle timeout");
                            to_drain.push(id.clone());
                        }
                    }
                }
            }
        }
        for id in to_drain {
            self.drain(&id).await?;
        }

        // 4. Claim-timeout reclaim with fencing.
        self.reclaim_timed_out_claims().await?;
        Ok(())
    }

    /// Reclaim `claimed` reviews whose holder is gone or stalled past the
    /// claim timeout. Live, non-draining reviewers keep their claims.
    async fn reclaim_timed_out_claims(&self) -> Result<()> {
        let claimed = db::list_claimed(&self.ctx.pool).await?;
        if claimed.is_empty() {
            return Ok(());
        }

        let (live, draining) = {
            let inner = self.inner.lock().await;
            (
                inner.live.keys().cloned().collect::<HashSet<_>>(),
                inner.draining.clone(),
            )
        };

        for review in claimed {
            let anchor = review
                .claimed_at
                .as_deref()
                .unwrap_or(&review.updated_at)
                .to_string();
            let age = db::legacy_age_seconds(&anchor)
                .or_else(|| db::legacy_age_seconds(&review.created_at))
                .unwrap_or(0.0);
            if age <= self.cfg.claim_timeout_seconds as f64 {
                continue;
            }

            let holder_ok = review
                .claimed_by
                .as_deref()
                .map(|h| live.contains(h) && !draining.contains(h))
                .unwrap_or(false);
            if holder_ok {
                continue;
            }

            tandem_broker::reclaim_review(&self.ctx, &review.id, "claim timeout").await?;
        }
        Ok(())
    }

    /// Spawn the two background tasks: the signal listener (reactive scaling
    /// and drain-completion) and the periodic maintenance timer. Both are
    /// cooperative tokio tasks that exit on shutdown.
    pub fn start(self: &Arc<Self>, mut signals: mpsc::UnboundedReceiver<PoolSignal>) {
        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    sig = signals.recv() => match sig {
                        Some(PoolSignal::ReviewCreated) => {
                            if let Err(e) = pool.maybe_scale_up().await {
                                error!(error = %e, "scale-up check failed");
                            }
                        }
                        Some(PoolSignal::ReviewerIdle(id)) => {
                            if let Err(e) = pool.on_reviewer_idle(&id).await {
                                error!(error = %e, reviewer = %id, "drain completion failed");
                            }
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        });

        let pool = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(pool.cfg.scale_check_seconds));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = pool.periodic_tick().await {
                            // Background failures are logged, never fatal.
                            error!(error = %e, "periodic pool check failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// A managed reviewer finished a verdict; retire it if it was draining
    /// and holds nothing else.
    async fn on_reviewer_idle(&self, reviewer_id: &str) -> Result<()> {
        let draining = {
            let inner = self.inner.lock().await;
            inner.draining.contains(reviewer_id)
        };
        if !draining {
            return Ok(());
        }
        let open = db::claimed_count_for_reviewer(&self.ctx.pool, reviewer_id).await?;
        if open == 0 {
            self.terminate_reviewer(reviewer_id, TERMINATE_GRACE).await?;
        }
        Ok(())
    }

    /// Lifespan teardown: stop background tasks, drain everything, and
    /// terminate survivors within a bounded grace period.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let ids = self.live_ids().await;
        for id in ids {
            if let Err(e) = self.terminate_reviewer(&id, SHUTDOWN_GRACE).await {
                error!(reviewer = %id, error = %e, "shutdown termination failed");
            }
        }
    }
}
