//! Site hook bindings.
//!
//! The host fires [`Hook`]s; a [`HookTable`] built once at startup from an
//! explicit list of [`Binding`]s turns each into zero or more protocol events.

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use shared::protocol::MAX_STACK_FRAMES;
use shared::types::{AgentEvent, ErrorKind, ErrorReport, RequestContext, StackFrame};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    AgentActivated,
    AgentDeactivated,
    PluginActivated,
    PluginDeactivated,
    ThemeSwitched,
    CoreUpdated,
    PhpError,
    HttpResponse,
    DatabaseError,
}

impl HookName {
    /// The WordPress action or handler the host wires this to
    pub fn wp_action(&self) -> &'static str {
        match self {
            HookName::AgentActivated => "activate_sitehub",
            HookName::AgentDeactivated => "deactivate_sitehub",
            HookName::PluginActivated => "activated_plugin",
            HookName::PluginDeactivated => "deactivated_plugin",
            HookName::ThemeSwitched => "switch_theme",
            HookName::CoreUpdated => "_core_updated_successfully",
            HookName::PhpError => "set_error_handler",
            HookName::HttpResponse => "http_api_debug",
            HookName::DatabaseError => "wpdb_error",
        }
    }
}

/// A fired hook with its typed arguments
#[derive(Debug, Clone)]
pub enum Hook {
    AgentActivated,
    AgentDeactivated,
    PluginActivated { slug: String, version: Option<String> },
    PluginDeactivated { slug: String },
    ThemeSwitched { slug: String },
    CoreUpdated { from: String, to: String },
    PhpError {
        /// PHP `E_*` level
        level: u32,
        message: String,
        file: Option<String>,
        line: Option<u32>,
        stack: Vec<StackFrame>,
        request: RequestContext,
        memory_usage: u64,
    },
    HttpResponse { url: String, status: u16, message: String },
    DatabaseError { message: String, request: RequestContext },
}

impl Hook {
    pub fn name(&self) -> HookName {
        match self {
            Hook::AgentActivated => HookName::AgentActivated,
            Hook::AgentDeactivated => HookName::AgentDeactivated,
            Hook::PluginActivated { .. } => HookName::PluginActivated,
            Hook::PluginDeactivated { .. } => HookName::PluginDeactivated,
            Hook::ThemeSwitched { .. } => HookName::ThemeSwitched,
            Hook::CoreUpdated { .. } => HookName::CoreUpdated,
            Hook::PhpError { .. } => HookName::PhpError,
            Hook::HttpResponse { .. } => HookName::HttpResponse,
            Hook::DatabaseError { .. } => HookName::DatabaseError,
        }
    }
}

/// Who fired the hook, and when
#[derive(Debug, Clone, Copy)]
pub struct HookContext {
    pub client_id: Uuid,
    pub now: DateTime<Utc>,
}

pub type Handler = fn(&Hook, &HookContext) -> Option<AgentEvent>;

#[derive(Clone, Copy)]
pub struct Binding {
    pub hook: HookName,
    pub handler: Handler,
}

impl Binding {
    pub const fn new(hook: HookName, handler: Handler) -> Self {
        Self { hook, handler }
    }
}

/// The bindings a stock agent installs
pub fn default_bindings() -> Vec<Binding> {
    vec![
        Binding::new(HookName::AgentActivated, on_lifecycle),
        Binding::new(HookName::AgentDeactivated, on_lifecycle),
        Binding::new(HookName::PluginActivated, on_plugin),
        Binding::new(HookName::PluginDeactivated, on_plugin),
        Binding::new(HookName::ThemeSwitched, on_theme),
        Binding::new(HookName::CoreUpdated, on_core_update),
        Binding::new(HookName::PhpError, on_php_error),
        Binding::new(HookName::HttpResponse, on_http_response),
        Binding::new(HookName::DatabaseError, on_database_error),
    ]
}

pub struct HookTable {
    handlers: HashMap<HookName, Vec<Handler>>,
}

impl HookTable {
    pub fn new(bindings: impl IntoIterator<Item = Binding>) -> Self {
        let mut handlers: HashMap<HookName, Vec<Handler>> = HashMap::new();
        for binding in bindings {
            handlers.entry(binding.hook).or_default().push(binding.handler);
        }
        Self { handlers }
    }

    pub fn is_bound(&self, hook: HookName) -> bool {
        self.handlers.contains_key(&hook)
    }

    /// Run every handler bound to `hook`, in binding order
    pub fn fire(&self, hook: &Hook, ctx: &HookContext) -> Vec<AgentEvent> {
        self.handlers
            .get(&hook.name())
            .map(|handlers| handlers.iter().filter_map(|h| h(hook, ctx)).collect())
            .unwrap_or_default()
    }
}

impl Default for HookTable {
    fn default() -> Self {
        Self::new(default_bindings())
    }
}

/// Map a PHP `E_*` level onto the protocol's error kinds
pub fn php_error_kind(level: u32) -> ErrorKind {
    match level {
        // E_ERROR, E_USER_ERROR, E_RECOVERABLE_ERROR
        1 | 256 | 4096 => ErrorKind::Fatal,
        4 => ErrorKind::Parse,
        // E_CORE_ERROR, E_COMPILE_ERROR
        16 | 64 => ErrorKind::Core,
        2 | 32 | 128 | 512 => ErrorKind::Warning,
        8192 | 16384 => ErrorKind::Deprecated,
        _ => ErrorKind::Notice,
    }
}

fn on_lifecycle(hook: &Hook, ctx: &HookContext) -> Option<AgentEvent> {
    match hook {
        Hook::AgentActivated => Some(AgentEvent::Activated { timestamp: ctx.now }),
        Hook::AgentDeactivated => Some(AgentEvent::Deactivated { timestamp: ctx.now }),
        _ => None,
    }
}

fn on_plugin(hook: &Hook, ctx: &HookContext) -> Option<AgentEvent> {
    match hook {
        Hook::PluginActivated { slug, version } => Some(AgentEvent::PluginActivated {
            slug: slug.clone(),
            version: version.clone(),
            timestamp: ctx.now,
        }),
        Hook::PluginDeactivated { slug } => Some(AgentEvent::PluginDeactivated {
            slug: slug.clone(),
            timestamp: ctx.now,
        }),
        _ => None,
    }
}

fn on_theme(hook: &Hook, ctx: &HookContext) -> Option<AgentEvent> {
    let Hook::ThemeSwitched { slug } = hook else {
        return None;
    };
    Some(AgentEvent::ThemeSwitched {
        slug: slug.clone(),
        timestamp: ctx.now,
    })
}

fn on_core_update(hook: &Hook, ctx: &HookContext) -> Option<AgentEvent> {
    let Hook::CoreUpdated { from, to } = hook else {
        return None;
    };
    Some(AgentEvent::CoreUpdated {
        from: from.clone(),
        to: to.clone(),
        timestamp: ctx.now,
    })
}

fn on_php_error(hook: &Hook, ctx: &HookContext) -> Option<AgentEvent> {
    let Hook::PhpError {
        level,
        message,
        file,
        line,
        stack,
        request,
        memory_usage,
    } = hook
    else {
        return None;
    };

    let mut report = ErrorReport::new(ctx.client_id, php_error_kind(*level), message.clone())
        .with_stack(stack.iter().take(MAX_STACK_FRAMES).cloned().collect());
    report.file = file.clone();
    report.line = *line;
    report.request = request.clone();
    report.memory_usage = *memory_usage;
    report.timestamp = ctx.now;
    Some(AgentEvent::Error(report))
}

/// Only failed responses are worth reporting
fn on_http_response(hook: &Hook, ctx: &HookContext) -> Option<AgentEvent> {
    let Hook::HttpResponse { url, status, message } = hook else {
        return None;
    };
    if *status < 400 {
        return None;
    }

    let mut report = ErrorReport::new(ctx.client_id, ErrorKind::Http, format!("HTTP {}: {}", status, message));
    report.http_status = Some(*status);
    report.request.url = Some(url.clone());
    report.timestamp = ctx.now;
    Some(AgentEvent::Error(report))
}

fn on_database_error(hook: &Hook, ctx: &HookContext) -> Option<AgentEvent> {
    let Hook::DatabaseError { message, request } = hook else {
        return None;
    };
    let mut report = ErrorReport::new(ctx.client_id, ErrorKind::Database, message.clone());
    report.request = request.clone();
    report.timestamp = ctx.now;
    Some(AgentEvent::Error(report))
}
