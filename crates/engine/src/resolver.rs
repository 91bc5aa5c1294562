use relmover_core::Conflict;

/// Decides what to commit when a staged write raced a concurrent commit.
///
/// Returning `Some(state)` replaces the staged state and rebases it onto the
/// committed revision; `None` leaves the conflict unresolved and the
/// transaction aborts.
pub trait ConflictResolver {
    fn resolve(
        &mut self,
        conflict: &Conflict,
        committed: Option<&[u8]>,
        staged: Option<&[u8]>,
    ) -> Option<Vec<u8>>;
}

/// Never resolves anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectConflicts;

impl ConflictResolver for RejectConflicts {
    fn resolve(&mut self, _: &Conflict, _: Option<&[u8]>, _: Option<&[u8]>) -> Option<Vec<u8>> {
        None
    }
}

impl<F> ConflictResolver for F
where
    F: FnMut(&Conflict, Option<&[u8]>, Option<&[u8]>) -> Option<Vec<u8>>,
{
    fn resolve(
        &mut self,
        conflict: &Conflict,
        committed: Option<&[u8]>,
        staged: Option<&[u8]>,
    ) -> Option<Vec<u8>> {
        self(conflict, committed, staged)
    }
}
