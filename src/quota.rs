use crate::sys::Sys;

/// Default file-size ceiling in bytes.
pub const DEFAULT_FILE_SIZE: i64 = 4_000_000_000;

/// Address-space ceiling used when total memory cannot be measured.
pub const FALLBACK_MEMORY: i64 = 4 * 1024 * 1024 * 1024;

/// Resource quotas for the launched program. `None` inherits the ambient limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quotas {
    pub cpu_seconds: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub file_size_bytes: Option<i64>,
    pub max_processes: Option<i64>,
}

impl Quotas {
    /// The quotas applied when the caller overrides none: inherited CPU time, total memory,
    /// [`DEFAULT_FILE_SIZE`] and twice the logical CPU count.
    pub fn host_defaults(sys: &impl Sys) -> Quotas {
        let memory = sys
            .total_memory()
            .and_then(|m| i64::try_from(m).ok())
            .unwrap_or(FALLBACK_MEMORY);
        Quotas {
            cpu_seconds: None,
            memory_bytes: Some(memory),
            file_size_bytes: Some(DEFAULT_FILE_SIZE),
            max_processes: Some(sys.cpu_count() as i64 * 2),
        }
    }
}

/// Parse a byte count with an optional `k`, `m`, `g` or `t` suffix, each a power of `base`.
///
/// Returns `None` for anything that is not a whole number or overflows.
pub fn parse_size(s: &str, base: i64) -> Option<i64> {
    let s = s.trim();
    let (digits, exponent) = match s.chars().last()?.to_ascii_lowercase() {
        'k' => (&s[..s.len() - 1], 1),
        'm' => (&s[..s.len() - 1], 2),
        'g' => (&s[..s.len() - 1], 3),
        't' => (&s[..s.len() - 1], 4),
        _ => (s, 0),
    };
    let n: i64 = digits.parse().ok()?;
    (0..exponent).try_fold(n, |acc, _| acc.checked_mul(base))
}
