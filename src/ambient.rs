//! Passes capabilities on to a child process (such as the capture program)
//! without having to mark the binary file itself with file capabilities.
//!
//! Ambient capabilities are per OS thread and survive `execve`, so raising
//! the right subset on the spawn thread right before fork/exec hands an
//! otherwise unprivileged child exactly those privileges.

use caps::{CapSet, Capability};

use crate::error::CaptureError;

/// Raises the given capabilities into the calling thread's ambient set, at
/// least those of them that are currently effective. Non-effective
/// capabilities are skipped silently, as the kernel would reject the whole
/// ambient set otherwise.
pub fn raise_ambient(wanted: &[Capability]) -> Result<(), CaptureError> {
    let effective = caps::read(None, CapSet::Effective)
        .map_err(|err| CaptureError::CapabilityPromotion(err.to_string()))?;
    for cap in wanted.iter().filter(|cap| effective.contains(*cap)) {
        // Ambient raising requires the capability to be inheritable first.
        caps::raise(None, CapSet::Inheritable, *cap)
            .and_then(|()| caps::raise(None, CapSet::Ambient, *cap))
            .map_err(|err| CaptureError::CapabilityPromotion(err.to_string()))?;
    }
    Ok(())
}
