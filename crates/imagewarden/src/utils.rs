//! Helper routines.

/// The `User-Agent` sent with every GitHub API request.
pub(crate) static IMAGEWARDEN_AGENT: &str =
    concat!("imagewarden/", env!("CARGO_PKG_VERSION"), " (+https://github.com/imagewarden/imagewarden)");

pub(crate) trait PipeSelf<F> {
    fn pipe(self, f: F) -> Self
    where
        F: FnOnce(Self) -> Self,
        Self: Sized,
    {
        f(self)
    }
}

impl<T, F> PipeSelf<F> for T where T: Sized {}

/// Formats a Unix timestamp as a rough duration from now,
/// e.g. `in 12 minutes`.
pub(crate) fn until(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    match timestamp.saturating_sub(now) {
        0 => "now".into(),
        secs if secs < 60 => format!("in {secs} seconds"),
        secs => format!("in {} minutes", secs.div_ceil(60)),
    }
}
