//! Small shared helpers: poison-tolerant locking and human-readable formatting

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Lock a std mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Format a byte count as a human-readable size ("1.50 MB")
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// "1h 2m 3s 4ms"
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    format!(
        "{}h {}m {}s {}ms",
        total_secs / 3600,
        (total_secs % 3600) / 60,
        total_secs % 60,
        elapsed.subsec_millis()
    )
}

/// "62m 3s 4ms" (hours folded into minutes)
pub fn format_elapsed_minutes(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    format!(
        "{}m {}s {}ms",
        total_secs / 60,
        total_secs % 60,
        elapsed.subsec_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_format_elapsed() {
        let elapsed = Duration::from_millis(3_723_004);
        assert_eq!(format_elapsed(elapsed), "1h 2m 3s 4ms");
        assert_eq!(format_elapsed_minutes(elapsed), "62m 3s 4ms");
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let clone = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert_eq!(*lock(&mutex), 1);
    }
}
