//! Forced action sequence for reproducing a specific scenario.

use std::sync::Mutex;

use super::DispatchError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ForcedEntry {
    dispatcher: String,
    action: String,
    conditional: bool,
}

/// Ordered `(dispatcher, action, conditional)` entries with a shared cursor.
///
/// Installed only when configured. The cursor is behind a mutex because the
/// sequence is shared by every dispatcher that receives it.
#[derive(Debug)]
pub struct ForcedSequence {
    entries: Vec<ForcedEntry>,
    cursor: Mutex<usize>,
}

impl ForcedSequence {
    /// Parse `"<dispatcher>[?].<action>"` descriptors. A trailing `?` on the
    /// dispatcher name marks an entry that is skipped when another dispatcher
    /// asks first.
    pub fn parse<S: AsRef<str>>(descriptors: &[S]) -> Result<Self, DispatchError> {
        let entries = descriptors
            .iter()
            .map(|d| {
                let d = d.as_ref();
                let (set, action) = d
                    .split_once('.')
                    .filter(|(set, action)| !set.is_empty() && !action.is_empty())
                    .ok_or_else(|| DispatchError::BadForcedDescriptor(d.to_string()))?;
                let (dispatcher, conditional) = match set.strip_suffix('?') {
                    Some(name) => (name, true),
                    None => (set, false),
                };
                Ok(ForcedEntry {
                    dispatcher: dispatcher.to_string(),
                    action: action.to_string(),
                    conditional,
                })
            })
            .collect::<Result<Vec<_>, DispatchError>>()?;
        Ok(Self {
            entries,
            cursor: Mutex::new(0),
        })
    }

    /// Action forced for `dispatcher` right now, if any. Advances the cursor
    /// on a match and past a non-matching conditional entry.
    pub fn next_for(&self, dispatcher: &str) -> Option<String> {
        let mut cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        let entry = self.entries.get(*cursor)?;
        if entry.dispatcher == dispatcher {
            *cursor += 1;
            Some(entry.action.clone())
        } else {
            if entry.conditional {
                *cursor += 1;
            }
            None
        }
    }

    pub fn is_exhausted(&self) -> bool {
        let cursor = self.cursor.lock().unwrap_or_else(|e| e.into_inner());
        *cursor >= self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptors() {
        let seq = ForcedSequence::parse(&["homeScreen.playRandom", "pvpScreen?.startChallenge"]).unwrap();
        assert_eq!(seq.entries.len(), 2);
        assert!(!seq.entries[0].conditional);
        assert!(seq.entries[1].conditional);
        assert_eq!(seq.entries[1].dispatcher, "pvpScreen");
        assert_eq!(seq.entries[1].action, "startChallenge");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(ForcedSequence::parse(&["homeScreen"]).is_err());
        assert!(ForcedSequence::parse(&[".playRandom"]).is_err());
        assert!(ForcedSequence::parse(&["homeScreen."]).is_err());
    }

    #[test]
    fn test_unconditional_entry_waits_for_its_dispatcher() {
        let seq = ForcedSequence::parse(&["homeScreen.playRandom"]).unwrap();
        assert_eq!(seq.next_for("session"), None);
        assert_eq!(seq.next_for("activityScreen"), None);
        assert_eq!(seq.next_for("homeScreen").as_deref(), Some("playRandom"));
        assert!(seq.is_exhausted());
        assert_eq!(seq.next_for("homeScreen"), None);
    }

    #[test]
    fn test_conditional_entry_is_skipped() {
        let seq = ForcedSequence::parse(&["pvpScreen?.startChallenge", "homeScreen.newTab"]).unwrap();
        assert_eq!(seq.next_for("homeScreen"), None);
        assert_eq!(seq.next_for("homeScreen").as_deref(), Some("newTab"));
    }
}
