//! Plugin and middleware system.

pub mod builtin;
mod context;
mod engine;
mod hooks;
mod middleware;

pub use builtin::{BuiltinPlugin, CommandDetector, FastAutoReply, SentimentAnalysis, Statistics};
pub use context::{PipelineContext, Sentiment};
pub use engine::{HookEngine, Plugin, PluginInfo, PluginStats};
pub use hooks::{fn_hook, FnHook, Hook, HookEvent};
pub use middleware::{plugin_error, Middleware, Next, Terminal};
