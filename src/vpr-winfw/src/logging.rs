//! Forward engine logs to the caller's sink
//!
//! Each instance gets its own `tracing` dispatcher built from a
//! `tracing-subscriber` registry and [`SinkLayer`]. ABI calls run with that
//! dispatcher as the default, so every event emitted by the policy engine
//! reaches the sink registered at initialization.

use std::ffi::{c_char, c_void, CString};
use std::fmt::{self, Write as _};

use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

pub const LOG_LEVEL_ERROR: u32 = 1;
pub const LOG_LEVEL_WARNING: u32 = 2;
pub const LOG_LEVEL_INFO: u32 = 4;
pub const LOG_LEVEL_DEBUG: u32 = 8;
pub const LOG_LEVEL_TRACE: u32 = 16;

/// `void sink(uint32_t level, const char *msg, void *ctx)`
pub type LogSinkFn = unsafe extern "system" fn(level: u32, msg: *const c_char, ctx: *mut c_void);

/// Null is accepted and disables logging.
pub type LogSink = Option<LogSinkFn>;

pub fn level_code(level: &Level) -> u32 {
    match *level {
        Level::ERROR => LOG_LEVEL_ERROR,
        Level::WARN => LOG_LEVEL_WARNING,
        Level::INFO => LOG_LEVEL_INFO,
        Level::DEBUG => LOG_LEVEL_DEBUG,
        Level::TRACE => LOG_LEVEL_TRACE,
    }
}

#[derive(Clone, Copy)]
struct Sink {
    func: LogSinkFn,
    ctx: *mut c_void,
}

// The caller guarantees the sink and its context stay valid and callable
// from any thread until deinitialization.
unsafe impl Send for Sink {}
unsafe impl Sync for Sink {}

/// Layer that formats each event into one line and hands it to the sink.
pub struct SinkLayer {
    sink: Sink,
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut line = LineVisitor::default();
        event.record(&mut line);
        let text = line.finish().replace('\0', " ");
        let Ok(msg) = CString::new(text) else {
            return;
        };
        let level = level_code(event.metadata().level());
        unsafe { (self.sink.func)(level, msg.as_ptr(), self.sink.ctx) }
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Dispatcher for one ABI instance; a null sink yields a no-op dispatcher.
pub fn dispatch(sink: LogSink, ctx: *mut c_void) -> Dispatch {
    match sink {
        Some(func) => Dispatch::new(tracing_subscriber::registry().with(SinkLayer {
            sink: Sink { func, ctx },
        })),
        None => Dispatch::none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::ffi::CStr;

    type Lines = Mutex<Vec<(u32, String)>>;

    unsafe extern "system" fn collect(level: u32, msg: *const c_char, ctx: *mut c_void) {
        let lines = &*(ctx as *const Lines);
        let text = CStr::from_ptr(msg).to_string_lossy().into_owned();
        lines.lock().push((level, text));
    }

    #[test]
    fn events_reach_the_sink() {
        let lines: Lines = Mutex::new(Vec::new());
        let dispatch = dispatch(Some(collect), &lines as *const Lines as *mut c_void);
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::warn!(policy = "blocked", filters = 8, "policy applied");
            tracing::trace!("lock acquired");
        });

        let lines = lines.lock();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, LOG_LEVEL_WARNING);
        assert_eq!(lines[0].1, "policy applied policy=blocked filters=8");
        assert_eq!(lines[1], (LOG_LEVEL_TRACE, "lock acquired".to_string()));
    }

    #[test]
    fn null_sink_is_silent() {
        let dispatch = dispatch(None, std::ptr::null_mut());
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::error!("nobody listens");
        });
    }
}
