//! The host panel as seen from its script container.

/// Callbacks from a container into the panel that owns it.
pub trait PanelHost {
    /// Version/build string shown in failure messages.
    fn build_info(&self) -> String {
        String::new()
    }

    /// Display a formatted failure on the panel surface.
    fn report_failure(&self, message: &str);

    /// Drop every timer the panel's script registered.
    fn unbind_timers(&self) {}
}

/// Format a failure for display: `Error: <crate> v<version> (<build>)`,
/// followed by the error text on its own line.
pub fn format_failure(build_info: &str, error_text: &str) -> String {
    let mut text = format!(
        "Error: {} v{} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        build_info
    );
    if !error_text.is_empty() {
        text.push('\n');
        text.push_str(error_text);
    }
    text
}
