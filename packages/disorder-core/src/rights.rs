//! User rights bitmask.
//!
//! A connection's rights are a bitmask granted at authentication time
//! (from the user record, or synthetically for the privileged socket) and
//! checked against each command's required-rights mask before dispatch.

use bitflags::bitflags;

bitflags! {
    /// Rights a user or connection may hold. Every command in
    /// `protocol::commands::TABLE` names a mask of these; holding any one
    /// bit of that mask is sufficient (`any bit matches`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Rights: u32 {
        /// Submit tracks to the queue.
        const PLAY           = 1 << 0;
        /// Pause/resume the currently playing track.
        const PAUSE          = 1 << 1;
        /// Scratch a track this connection's user submitted.
        const SCRATCH_MINE   = 1 << 2;
        /// Scratch a randomly selected track.
        const SCRATCH_RANDOM = 1 << 3;
        /// Scratch any track regardless of submitter.
        const SCRATCH_ANY    = 1 << 4;
        /// Remove a queue entry this connection's user submitted.
        const REMOVE_MINE    = 1 << 5;
        /// Remove a randomly selected queue entry.
        const REMOVE_RANDOM  = 1 << 6;
        /// Remove any queue entry.
        const REMOVE_ANY     = 1 << 7;
        /// Move a queue entry this connection's user submitted.
        const MOVE_MINE      = 1 << 8;
        /// Move a randomly selected queue entry.
        const MOVE_RANDOM    = 1 << 9;
        /// Move any queue entry.
        const MOVE_ANY       = 1 << 10;
        /// Adjust output volume.
        const VOLUME         = 1 << 11;
        /// Full administrative access (user management, shutdown, reconfigure).
        const ADMIN          = 1 << 12;
        /// Trigger a library rescan.
        const RESCAN         = 1 << 13;
        /// Self-register a new account.
        const REGISTER       = 1 << 14;
        /// Read/write this user's own track preferences.
        const PREFS          = 1 << 15;
        /// Read/write global preferences.
        const GLOBAL_PREFS   = 1 << 16;
        /// Query other users' account info.
        const USERINFO       = 1 << 17;
        /// Read-only queries (queue, playing, search, stats, ...).
        const READ           = 1 << 18;
        /// Synthetic bit granted only to connections accepted on the
        /// privileged local socket; never stored in a user record.
        const LOCAL           = 1 << 19;

        /// Union of every `*_mine`/`*_random`/`*_any` scratch bit, used by
        /// the command table's combined `scratch` entry.
        const SCRATCH__MASK = Self::SCRATCH_MINE.bits() | Self::SCRATCH_RANDOM.bits() | Self::SCRATCH_ANY.bits();
        /// Union of every remove right.
        const REMOVE__MASK = Self::REMOVE_MINE.bits() | Self::REMOVE_RANDOM.bits() | Self::REMOVE_ANY.bits();
        /// Union of every move right.
        const MOVE__MASK = Self::MOVE_MINE.bits() | Self::MOVE_RANDOM.bits() | Self::MOVE_ANY.bits();
    }
}

impl Rights {
    /// Parses a space-separated rights word list (as stored in
    /// `default_rights` and user records) into a mask. Unknown words are
    /// ignored rather than rejected, so a rights string from an older or
    /// newer server version never fails to parse outright.
    pub fn parse(words: &str) -> Self {
        let mut rights = Rights::empty();
        for word in words.split_whitespace() {
            rights |= match word {
                "play" => Rights::PLAY,
                "pause" => Rights::PAUSE,
                "scratch~mine" => Rights::SCRATCH_MINE,
                "scratch~random" => Rights::SCRATCH_RANDOM,
                "scratch~any" | "scratch" => Rights::SCRATCH_ANY,
                "remove~mine" => Rights::REMOVE_MINE,
                "remove~random" => Rights::REMOVE_RANDOM,
                "remove~any" | "remove" => Rights::REMOVE_ANY,
                "move~mine" => Rights::MOVE_MINE,
                "move~random" => Rights::MOVE_RANDOM,
                "move~any" | "move" => Rights::MOVE_ANY,
                "volume" => Rights::VOLUME,
                "admin" => Rights::ADMIN,
                "rescan" => Rights::RESCAN,
                "register" => Rights::REGISTER,
                "prefs" => Rights::PREFS,
                "global prefs" | "global-prefs" => Rights::GLOBAL_PREFS,
                "userinfo" => Rights::USERINFO,
                "read" => Rights::READ,
                _ => Rights::empty(),
            };
        }
        rights
    }

    /// Renders the mask back to its word-list form, for persistence and
    /// the `userinfo`/`edituser` commands.
    pub fn to_words(self) -> String {
        let pairs: &[(Rights, &str)] = &[
            (Rights::PLAY, "play"),
            (Rights::PAUSE, "pause"),
            (Rights::SCRATCH_MINE, "scratch~mine"),
            (Rights::SCRATCH_RANDOM, "scratch~random"),
            (Rights::SCRATCH_ANY, "scratch~any"),
            (Rights::REMOVE_MINE, "remove~mine"),
            (Rights::REMOVE_RANDOM, "remove~random"),
            (Rights::REMOVE_ANY, "remove~any"),
            (Rights::MOVE_MINE, "move~mine"),
            (Rights::MOVE_RANDOM, "move~random"),
            (Rights::MOVE_ANY, "move~any"),
            (Rights::VOLUME, "volume"),
            (Rights::ADMIN, "admin"),
            (Rights::RESCAN, "rescan"),
            (Rights::REGISTER, "register"),
            (Rights::PREFS, "prefs"),
            (Rights::GLOBAL_PREFS, "global-prefs"),
            (Rights::USERINFO, "userinfo"),
            (Rights::READ, "read"),
        ];
        pairs
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, word)| *word)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// True if `self` satisfies a command's required-rights mask: any one
    /// bit in common is sufficient. An empty `required` mask means the
    /// command needs no rights at all (always passes).
    pub fn satisfies(self, required: Rights) -> bool {
        required.is_empty() || self.intersects(required)
    }
}

/// Decides whether `rights` permits a mine/random/any-scoped operation
/// (remove/move/scratch) against a specific queue entry.
///
/// `submitter` is the entry's original submitter username, if any (a
/// randomly-selected, unadopted entry has none). `is_random_origin` is
/// true for entries that were chosen by the random selector rather than
/// submitted or adopted by a user.
pub fn right_scoped(
    rights: Rights,
    mine_bit: Rights,
    random_bit: Rights,
    any_bit: Rights,
    connection_user: &str,
    submitter: Option<&str>,
    is_random_origin: bool,
) -> bool {
    if rights.contains(any_bit) {
        return true;
    }
    if is_random_origin && rights.contains(random_bit) {
        return true;
    }
    if submitter == Some(connection_user) && rights.contains(mine_bit) {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_known_words() {
        let rights = Rights::parse("read play pause volume");
        assert!(rights.contains(Rights::READ));
        assert!(rights.contains(Rights::PLAY));
        assert!(rights.contains(Rights::PAUSE));
        assert!(rights.contains(Rights::VOLUME));
        assert!(!rights.contains(Rights::ADMIN));
    }

    #[test]
    fn unknown_word_is_ignored_not_rejected() {
        let rights = Rights::parse("read bogus-future-right play");
        assert_eq!(rights, Rights::READ | Rights::PLAY);
    }

    #[test]
    fn satisfies_any_bit_in_mask() {
        let rights = Rights::READ;
        assert!(rights.satisfies(Rights::READ | Rights::ADMIN));
        assert!(!rights.satisfies(Rights::ADMIN));
    }

    #[test]
    fn empty_required_mask_always_satisfied() {
        assert!(Rights::empty().satisfies(Rights::empty()));
    }

    #[test]
    fn scoped_right_mine_requires_matching_submitter() {
        let rights = Rights::REMOVE_MINE;
        assert!(right_scoped(
            rights,
            Rights::REMOVE_MINE,
            Rights::REMOVE_RANDOM,
            Rights::REMOVE_ANY,
            "alice",
            Some("alice"),
            false
        ));
        assert!(!right_scoped(
            rights,
            Rights::REMOVE_MINE,
            Rights::REMOVE_RANDOM,
            Rights::REMOVE_ANY,
            "alice",
            Some("bob"),
            false
        ));
    }

    #[test]
    fn scoped_right_any_overrides_submitter_check() {
        let rights = Rights::REMOVE_ANY;
        assert!(right_scoped(
            rights,
            Rights::REMOVE_MINE,
            Rights::REMOVE_RANDOM,
            Rights::REMOVE_ANY,
            "alice",
            Some("bob"),
            false
        ));
    }

    #[test]
    fn scoped_right_random_requires_random_origin() {
        let rights = Rights::MOVE_RANDOM;
        assert!(right_scoped(
            rights,
            Rights::MOVE_MINE,
            Rights::MOVE_RANDOM,
            Rights::MOVE_ANY,
            "alice",
            None,
            true
        ));
        assert!(!right_scoped(
            rights,
            Rights::MOVE_MINE,
            Rights::MOVE_RANDOM,
            Rights::MOVE_ANY,
            "alice",
            None,
            false
        ));
    }

    #[test]
    fn words_round_trip_through_parse() {
        let rights = Rights::READ | Rights::PLAY | Rights::ADMIN;
        let words = rights.to_words();
        assert_eq!(Rights::parse(&words), rights);
    }
}
