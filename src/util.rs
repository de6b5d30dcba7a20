//! Utility traits and functions.
//!
//! This module provides general-purpose utilities including:
//! * Type conversion traits
//! * File name sanitization for cache and library files

/// Trait for converting numeric values to `f32` with controlled truncation.
///
/// Provides safe conversion to `f32` by:
/// * Clamping values to `f32` range
/// * Preventing infinity values
/// * Preventing NaN values
///
/// # Example
///
/// ```rust
/// use cadenza::util::ToF32;
///
/// let large_value: f64 = 1e308;
/// let clamped: f32 = large_value.to_f32_lossy();
/// assert!(clamped == f32::MAX);
/// ```
pub trait ToF32 {
    /// Converts a value to `f32`, clamping to prevent invalid results.
    ///
    /// Values outside the `f32` range are clamped to the nearest valid value:
    /// * Values > `f32::MAX` become `f32::MAX`
    /// * Values < `f32::MIN` become `f32::MIN`
    ///
    /// # Returns
    ///
    /// A valid `f32` value within the supported range.
    fn to_f32_lossy(self) -> f32;
}

/// Implements conversion from `f64` to `f32` with range clamping.
impl ToF32 for f64 {
    #[expect(clippy::cast_possible_truncation)]
    fn to_f32_lossy(self) -> f32 {
        self.clamp(f64::from(f32::MIN), f64::from(f32::MAX)) as f32
    }
}

/// Characters that are replaced when building file names.
///
/// These are the characters rejected by at least one of the supported
/// filesystems, NTFS being the strictest.
const FORBIDDEN_FILE_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Sanitizes a string for use as a file name component.
///
/// * Replaces filesystem-reserved characters with `_`
/// * Collapses runs of whitespace into a single space
/// * Trims leading and trailing whitespace
///
/// # Example
///
/// ```rust
/// use cadenza::util::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name("AC/DC: Powerage?"), "AC_DC_ Powerage_");
/// ```
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    let mut last_was_space = false;

    for chr in name.chars() {
        if FORBIDDEN_FILE_CHARS.contains(&chr) {
            result.push('_');
            last_was_space = false;
        } else if chr.is_whitespace() {
            if !last_was_space {
                result.push(' ');
            }
            last_was_space = true;
        } else {
            result.push(chr);
            last_was_space = false;
        }
    }

    result.trim().to_string()
}

/// Checks a batch of paths for existence on the blocking pool.
///
/// Filesystem stats can take tens of milliseconds on slow media; never
/// call `exists()` from a latency-sensitive task when a batch can go
/// through here instead.
pub async fn stat_many(paths: Vec<std::path::PathBuf>) -> Vec<bool> {
    tokio::task::spawn_blocking(move || {
        paths
            .iter()
            .map(|path| path.try_exists().unwrap_or(false))
            .collect()
    })
    .await
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(
            sanitize_file_name("a<b>c:d\"e/f\\g|h?i*j"),
            "a_b_c_d_e_f_g_h_i_j"
        );
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitize_file_name("  too   many\t spaces  "), "too many spaces");
    }

    #[test]
    fn sanitize_keeps_unicode() {
        assert_eq!(
            sanitize_file_name("Sigur Rós - Ágætis byrjun"),
            "Sigur Rós - Ágætis byrjun"
        );
    }

    #[test]
    fn to_f32_clamps() {
        assert_eq!(1e308_f64.to_f32_lossy(), f32::MAX);
        assert_eq!((-1e308_f64).to_f32_lossy(), f32::MIN);
    }

    #[tokio::test]
    async fn stat_many_reports_per_path() {
        let existing = std::env::temp_dir();
        let missing = existing.join("cadenza-definitely-missing");
        let results = stat_many(vec![existing, missing]).await;
        assert_eq!(results, vec![true, false]);
    }
}
