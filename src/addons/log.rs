//! One-line flow summaries.

use crate::proxy::addon::Addon;
use crate::proxy::flow::Flow;

/// Logs a summary line for every completed or failed flow, in the spirit
/// of mitmdump: method, status, host, path, duration, upstream, tags.
pub struct LogAddon;

impl Addon for LogAddon {
    fn on_complete(&self, flow: &Flow) {
        log_flow(flow);
    }

    fn on_error(&self, flow: &Flow, _error: &str) {
        log_flow(flow);
    }
}

fn log_flow(flow: &Flow) {
    let duration_ms = flow.duration().as_millis() as u64;
    let data = flow.read();
    let tags = data.tags.join(",");
    match &data.response {
        Some(response) => {
            tracing::info!(
                method = %data.request.method,
                status = response.status_code,
                host = %data.request.host,
                path = %data.request.path,
                duration_ms,
                size = %format_size(response.body.len()),
                upstream = %flow.upstream,
                tags = %tags,
                "flow"
            );
        }
        None => {
            tracing::warn!(
                method = %data.request.method,
                host = %data.request.host,
                path = %data.request.path,
                duration_ms,
                upstream = %flow.upstream,
                error = data.error.as_deref().unwrap_or(""),
                tags = %tags,
                "flow failed"
            );
        }
    }
}

fn format_size(n: usize) -> String {
    if n < 1024 {
        format!("{n}B")
    } else if n < 1024 * 1024 {
        format!("{:.1}K", n as f64 / 1024.0)
    } else {
        format!("{:.1}M", n as f64 / 1024.0 / 1024.0)
    }
}
