use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Memory pressure signal shared by the components that launch or buffer
/// large resources.
///
/// There is no global instance: the host creates one, feeds it usage samples
/// (or calls [`PressureMonitor::refresh`]) and hands an `Arc` to the pool and
/// the orchestrator.
#[derive(Debug)]
pub struct PressureMonitor {
    max_memory: usize,
    current_usage: AtomicUsize,
    alert_threshold: usize,
}

impl PressureMonitor {
    pub fn new(max_memory: usize) -> Self {
        Self {
            max_memory,
            current_usage: AtomicUsize::new(0),
            alert_threshold: (max_memory as f64 * 0.8) as usize,
        }
    }

    pub fn check(&self) -> PressureLevel {
        let current = self.current_usage.load(Ordering::Relaxed);

        if current > self.max_memory {
            PressureLevel::Critical
        } else if current > self.alert_threshold {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    pub fn update_usage(&self, usage: usize) {
        self.current_usage.store(usage, Ordering::Relaxed);
    }

    pub fn get_usage(&self) -> usize {
        self.current_usage.load(Ordering::Relaxed)
    }

    pub fn get_usage_percentage(&self) -> f64 {
        if self.max_memory == 0 {
            return 0.0;
        }
        let current = self.current_usage.load(Ordering::Relaxed);
        (current as f64 / self.max_memory as f64) * 100.0
    }

    /// Sample this process's resident set size and record it.
    pub fn refresh(&self) -> PressureLevel {
        if let Some(rss) = read_process_rss() {
            self.update_usage(rss);
        }
        self.check()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

/// Resident set size of the current process, from `/proc/self/status`.
///
/// Returns `None` where procfs is not available.
pub fn read_process_rss() -> Option<usize> {
    let content = std::fs::read_to_string("/proc/self/status").ok()?;
    content
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<usize>().ok())
        .map(|kb| kb * 1024)
}

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Join a service base URL and an endpoint path with exactly one slash.
pub fn join_url(base: &str, endpoint: &str) -> String {
    let base = base.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    if endpoint.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{endpoint}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("q3/report.pdf"), "q3_report.pdf");
        assert_eq!(sanitize_filename("a:b?.png"), "a_b_.png");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://svc:3000/", "/convert"), "http://svc:3000/convert");
        assert_eq!(join_url("http://svc:3000", "health"), "http://svc:3000/health");
        assert_eq!(join_url("http://svc:3000/", ""), "http://svc:3000");
    }

    #[test]
    fn test_pressure_levels() {
        let monitor = PressureMonitor::new(1024 * 1024);
        assert_eq!(monitor.check(), PressureLevel::Normal);
        assert_eq!(monitor.get_usage_percentage(), 0.0);

        monitor.update_usage(512 * 1024);
        assert_eq!(monitor.check(), PressureLevel::Normal);
        assert_eq!(monitor.get_usage_percentage(), 50.0);

        monitor.update_usage(900 * 1024);
        assert_eq!(monitor.check(), PressureLevel::Warning);

        monitor.update_usage(1100 * 1024);
        assert_eq!(monitor.check(), PressureLevel::Critical);
    }
}
