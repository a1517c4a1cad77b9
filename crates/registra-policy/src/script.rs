//! QuickJS script host for trusted policy snippets.
//!
//! Scripted facts and scripted operations run inside a pool of sandboxed
//! QuickJS runtimes. Each runtime has its own context behind a mutex and is
//! configured with memory and stack limits; round-robin selection spreads
//! load across the pool. Bindings are injected as JSON globals and the
//! script's return value is marshalled back through `JSON.stringify`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rquickjs::{Context, Ctx, Function, Object, Runtime};
use serde_json::Value;

// =============================================================================
// Errors
// =============================================================================

/// Script host errors. These propagate to the evaluation caller: scripted
/// logic is trusted policy code and its failure is not absorbed.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Script host initialization failed: {0}")]
    Init(String),

    #[error("Script execution failed: {0}")]
    Runtime(String),

    #[error("Script result could not be marshalled: {0}")]
    Marshal(String),
}

// =============================================================================
// Host trait
// =============================================================================

/// Executes a script with named JSON bindings and returns its result.
pub trait ScriptHost: Send + Sync {
    fn run(&self, script: &str, bindings: &serde_json::Map<String, Value>)
    -> Result<Value, ScriptError>;
}

// =============================================================================
// QuickJS implementation
// =============================================================================

/// Configuration for the QuickJS runtime pool.
#[derive(Debug, Clone)]
pub struct QuickJsConfig {
    /// Number of pooled runtime instances.
    pub pool_size: usize,

    /// Per-runtime memory limit in megabytes.
    pub memory_limit_mb: usize,

    /// Per-runtime stack limit in kilobytes.
    pub max_stack_size_kb: usize,

    /// Wall-clock execution budget in milliseconds.
    pub timeout_ms: u64,
}

impl Default for QuickJsConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            memory_limit_mb: 16,
            max_stack_size_kb: 512,
            timeout_ms: 1000,
        }
    }
}

/// QuickJS runtime pool.
pub struct QuickJsScriptHost {
    instances: Vec<Mutex<QuickJsInstance>>,
    config: QuickJsConfig,
    counter: AtomicUsize,
}

struct QuickJsInstance {
    runtime: Runtime,
    context: Context,
}

impl QuickJsScriptHost {
    /// Create a runtime pool with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any runtime instance fails to initialize.
    pub fn new(config: QuickJsConfig) -> Result<Self, ScriptError> {
        let pool_size = config.pool_size.max(1);
        let mut instances = Vec::with_capacity(pool_size);

        for _ in 0..pool_size {
            let runtime = Runtime::new().map_err(|e| ScriptError::Init(e.to_string()))?;
            runtime.set_memory_limit(config.memory_limit_mb * 1024 * 1024);
            runtime.set_max_stack_size(config.max_stack_size_kb * 1024);

            let context =
                Context::full(&runtime).map_err(|e| ScriptError::Init(e.to_string()))?;

            instances.push(Mutex::new(QuickJsInstance { runtime, context }));
        }

        Ok(Self {
            instances,
            config,
            counter: AtomicUsize::new(0),
        })
    }

    fn run_with_instance(
        &self,
        instance: &QuickJsInstance,
        script: &str,
        bindings: &serde_json::Map<String, Value>,
    ) -> Result<Value, ScriptError> {
        let start = Instant::now();
        let timeout_ms = self.config.timeout_ms;

        instance
            .runtime
            .set_interrupt_handler(Some(Box::new(move || {
                start.elapsed().as_millis() > timeout_ms as u128
            })));

        let result = instance
            .context
            .with(|ctx| Self::execute(&ctx, script, bindings));

        instance.runtime.set_interrupt_handler(None);

        result
    }

    fn execute(
        ctx: &Ctx<'_>,
        script: &str,
        bindings: &serde_json::Map<String, Value>,
    ) -> Result<Value, ScriptError> {
        Self::setup_console(ctx).map_err(|e| ScriptError::Init(e.to_string()))?;

        // Bindings are declared with var so re-evaluation in the same
        // persistent context can rebind them.
        let mut setup = String::new();
        for (name, value) in bindings {
            let json = serde_json::to_string(value).map_err(|e| ScriptError::Marshal(e.to_string()))?;
            setup.push_str(&format!("var {name} = {json};\n"));
        }
        ctx.eval::<(), _>(setup.as_bytes())
            .map_err(|e| ScriptError::Runtime(format_js_error(ctx, e)))?;

        // The user script runs inside a function so it can use return
        // statements; the result round-trips through JSON.
        let wrapped = format!(
            "var __result = (function() {{\n{script}\n}})();\nJSON.stringify(__result === undefined ? null : __result)"
        );
        let serialized: String = ctx
            .eval(wrapped.as_bytes())
            .map_err(|e| ScriptError::Runtime(format_js_error(ctx, e)))?;

        serde_json::from_str(&serialized).map_err(|e| ScriptError::Marshal(e.to_string()))
    }

    fn setup_console(ctx: &Ctx<'_>) -> Result<(), rquickjs::Error> {
        let globals = ctx.globals();
        let console = Object::new(ctx.clone())?;

        console.set(
            "log",
            Function::new(ctx.clone(), |msg: String| {
                tracing::debug!(target: "quickjs", message = %msg, "console.log");
            })?,
        )?;
        console.set(
            "warn",
            Function::new(ctx.clone(), |msg: String| {
                tracing::warn!(target: "quickjs", message = %msg, "console.warn");
            })?,
        )?;
        console.set(
            "error",
            Function::new(ctx.clone(), |msg: String| {
                tracing::error!(target: "quickjs", message = %msg, "console.error");
            })?,
        )?;

        globals.set("console", console)?;
        Ok(())
    }

    /// Pool statistics.
    #[must_use]
    pub fn stats(&self) -> ScriptHostStats {
        ScriptHostStats {
            pool_size: self.instances.len(),
            evaluations: self.counter.load(Ordering::Relaxed),
        }
    }
}

impl ScriptHost for QuickJsScriptHost {
    fn run(
        &self,
        script: &str,
        bindings: &serde_json::Map<String, Value>,
    ) -> Result<Value, ScriptError> {
        let instance_idx = self.counter.fetch_add(1, Ordering::Relaxed) % self.instances.len();

        let instance = match self.instances[instance_idx].lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Script host instance mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        };

        self.run_with_instance(&instance, script, bindings)
    }
}

fn format_js_error(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    if matches!(error, rquickjs::Error::Exception) {
        let exc = ctx.catch();
        if let Some(exc) = exc.as_exception() {
            return exc
                .message()
                .unwrap_or_else(|| "uncaught exception".to_string());
        }
    }
    error.to_string()
}

/// Statistics about the script host pool.
#[derive(Debug, Clone)]
pub struct ScriptHostStats {
    pub pool_size: usize,
    pub evaluations: usize,
}
