//! Process-wide library configuration. `ARTIO_DEFAULT_BUFFER_SIZE` (spec.md
//! §9, "Global mutable state") is the only knob the spec calls out; modeled
//! as a settable value passed into [`crate::Fileset`] rather than a
//! module-level static.

/// Default size, in bytes, of the buffer a stream attaches to a file handle
/// for offset-table cache fills and record I/O.
pub const ARTIO_DEFAULT_BUFFER_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoConfig {
    pub default_buffer_size: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            default_buffer_size: ARTIO_DEFAULT_BUFFER_SIZE,
        }
    }
}

impl IoConfig {
    pub fn new(default_buffer_size: usize) -> Self {
        Self { default_buffer_size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_constant() {
        assert_eq!(IoConfig::default().default_buffer_size, ARTIO_DEFAULT_BUFFER_SIZE);
    }
}
