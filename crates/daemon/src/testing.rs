//! Test doubles shared by the unit tests of several modules.

use crate::cache::JobCache;
use crate::concurrency::WorkerPlan;
use crate::engine::{Engine, FallbackChain, FallbackStep, Invocation, InvocationResult};
use crate::executor::{ConversionExecutor, ExecutorSettings};
use crate::jobs::AttemptStatus;
use crate::metrics::{new_shared_metrics, SharedMetrics};
use crate::pool::WorkerPool;
use crate::scheduler::Scheduler;
use crate::template::TemplateValidator;
use crate::toolchain::{DependencyIndex, Presence};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// In-memory dependency index. Anything not listed is `Missing`.
#[derive(Debug, Default, Clone)]
pub struct StaticIndex {
    pub tex_files: HashSet<String>,
    pub fonts: HashSet<String>,
    pub binaries: HashSet<String>,
}

impl StaticIndex {
    pub fn with_tex_files(files: &[&str]) -> Self {
        Self {
            tex_files: files.iter().map(|f| f.to_string()).collect(),
            ..Self::default()
        }
    }
}

fn presence(found: bool) -> Presence {
    if found {
        Presence::Present
    } else {
        Presence::Missing
    }
}

impl DependencyIndex for StaticIndex {
    fn tex_file(&self, name: &str) -> Presence {
        presence(self.tex_files.contains(name))
    }

    fn font(&self, family: &str) -> Presence {
        presence(self.fonts.contains(family))
    }

    fn binary(&self, name: &str) -> Presence {
        presence(self.binaries.contains(name))
    }
}

/// Engine that succeeds or fails on command and counts its invocations.
///
/// On success it writes a small fake artifact to the requested output path.
#[derive(Debug)]
pub struct ScriptedEngine {
    name: String,
    succeed: AtomicBool,
    degraded: bool,
    delay: Duration,
    invocations: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(name: &str, succeed: bool) -> Self {
        Self {
            name: name.to_string(),
            succeed: AtomicBool::new(succeed),
            degraded: false,
            delay: Duration::ZERO,
            invocations: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_succeed(&self, succeed: bool) {
        self.succeed.store(succeed, Ordering::SeqCst);
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous invocations observed.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_extension(&self) -> &str {
        if self.degraded {
            "docx"
        } else {
            "pdf"
        }
    }

    fn is_degraded(&self) -> bool {
        self.degraded
    }

    async fn invoke(&self, invocation: Invocation<'_>) -> InvocationResult {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let succeed = self.succeed.load(Ordering::SeqCst);
        let exit = if succeed {
            match tokio::fs::write(invocation.output, format!("%PDF-1.5 scripted by {}\n", self.name)).await {
                Ok(()) => AttemptStatus::Succeeded,
                Err(e) => AttemptStatus::SpawnFailed(e.to_string()),
            }
        } else {
            AttemptStatus::Exited(43)
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        InvocationResult {
            command: format!(
                "scripted {} template={}",
                self.name,
                invocation.template.is_some()
            ),
            exit,
            diagnostics: if succeed {
                String::new()
            } else {
                "! LaTeX Error: scripted failure.".to_string()
            },
        }
    }
}

/// Seven-step chain shaped like the production one, with one scripted engine
/// per step so each step's result can be set independently.
pub fn scripted_chain(outcomes: [bool; 7]) -> (FallbackChain, Vec<Arc<ScriptedEngine>>) {
    const NAMES: [&str; 3] = ["xelatex", "lualatex", "pdflatex"];
    let mut engines = Vec::with_capacity(7);
    let mut steps = Vec::with_capacity(7);
    for (i, ok) in outcomes.iter().enumerate() {
        let engine = if i < 6 {
            Arc::new(ScriptedEngine::new(NAMES[i % 3], *ok))
        } else {
            Arc::new(ScriptedEngine::new("docx", *ok).degraded())
        };
        steps.push(FallbackStep::new(engine.clone() as Arc<dyn Engine>, i < 3));
        engines.push(engine);
    }
    (FallbackChain::new(steps), engines)
}

/// Total invocations across a set of scripted engines.
pub fn total_invocations(engines: &[Arc<ScriptedEngine>]) -> usize {
    engines.iter().map(|e| e.invocations()).sum()
}

/// Minimal template that passes validation against [`TestStack`]'s index.
pub const TEST_TEMPLATE: &str =
    "\\documentclass{article}\n\\usepackage{geometry}\n\\begin{document}\n$body$\n\\end{document}\n";

/// Cache, executor, pool and scheduler wired over temporary directories.
pub struct TestStack {
    pub temp: TempDir,
    pub scheduler: Arc<Scheduler>,
    pub cache: Arc<JobCache>,
    pub metrics: SharedMetrics,
}

impl TestStack {
    pub fn new(chain: FallbackChain, with_template: bool) -> Self {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("input");
        let output = temp.path().join("output");
        std::fs::create_dir_all(&input).unwrap();

        let template = with_template.then(|| {
            let path = temp.path().join("template.tex");
            std::fs::write(&path, TEST_TEMPLATE).unwrap();
            path
        });

        let metrics = new_shared_metrics().unwrap();
        let cache = Arc::new(JobCache::open(output.join("logs/jobcache")).unwrap());
        let index = StaticIndex::with_tex_files(&["article.cls", "geometry.sty"]);
        let executor = Arc::new(ConversionExecutor::new(
            chain,
            Arc::new(TemplateValidator::new(Arc::new(index))),
            metrics.clone(),
            ExecutorSettings {
                output_dir: output,
                attempt_timeout: Duration::from_secs(5),
                bypass_validation: false,
                min_free_disk_mb: 0,
            },
        ));
        let plan = WorkerPlan {
            total_cores: 4,
            max_concurrent_jobs: 2,
            queue_capacity: 16,
        };
        let pool = WorkerPool::start(plan, executor, cache.clone(), metrics.clone(), false);
        let scheduler = Arc::new(Scheduler::new(pool, cache.clone(), metrics.clone(), input, template));
        Self {
            temp,
            scheduler,
            cache,
            metrics,
        }
    }

    pub fn input(&self) -> PathBuf {
        self.temp.path().join("input")
    }

    pub fn write(&self, name: &str, body: &str) -> PathBuf {
        let path = self.input().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }
}

/// Single-step chain around one slow engine.
pub fn slow_chain(delay: Duration) -> (FallbackChain, Arc<ScriptedEngine>) {
    let engine = Arc::new(ScriptedEngine::new("xelatex", true).with_delay(delay));
    let chain = FallbackChain::new(vec![FallbackStep::new(engine.clone() as Arc<dyn Engine>, false)]);
    (chain, engine)
}
