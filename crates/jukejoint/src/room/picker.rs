//! Next-song selection.
//!
//! A pure function of `(queue, playlist_epoch, current_order_index)`:
//!
//! 1. a playable interrupt past the current position wins outright;
//! 2. otherwise the next playable song generated at the current epoch;
//! 3. otherwise any next playable song (stale-epoch filler across a
//!    steering transition);
//! 4. otherwise nothing.
//!
//! A still-generating interrupt is surfaced separately so the UI can show
//! "up next" before its audio exists; it never delays a ready song.

use jukeproto::Song;

#[derive(Debug, Default)]
pub struct NextSongPick<'a> {
    pub song: Option<&'a Song>,
    /// Interrupt past the current position that is still rendering.
    pub generating_interrupt: Option<&'a Song>,
}

pub fn pick_next_song(
    queue: &[Song],
    playlist_epoch: i64,
    current_order_index: f64,
) -> NextSongPick<'_> {
    let after = |song: &Song| song.order_index > current_order_index;
    let min_by_order = |a: &&Song, b: &&Song| {
        a.order_index
            .partial_cmp(&b.order_index)
            .unwrap_or(std::cmp::Ordering::Equal)
    };

    let mut pick = NextSongPick::default();

    // 1. Interrupts first.
    if let Some(interrupt) = queue
        .iter()
        .filter(|s| s.is_interrupt && after(s) && s.is_playable())
        .min_by(min_by_order)
    {
        pick.song = Some(interrupt);
        return pick;
    }
    pick.generating_interrupt = queue
        .iter()
        .filter(|s| s.is_interrupt && after(s) && s.status.is_generating())
        .min_by(min_by_order);

    // 2. Next playable song at the current epoch.
    if let Some(song) = queue
        .iter()
        .filter(|s| s.is_playable() && after(s) && s.prompt_epoch == playlist_epoch)
        .min_by(min_by_order)
    {
        pick.song = Some(song);
        return pick;
    }

    // 3. Transition gap: any playable filler.
    pick.song = queue
        .iter()
        .filter(|s| s.is_playable() && after(s))
        .min_by(min_by_order);
    pick
}

/// Where an idle room starts in a fresh queue. A long-lived session picks
/// up near its tail instead of replaying history.
pub fn idle_start_order_index(queue: &[Song]) -> f64 {
    if queue.len() > 100 {
        // Start at position len-10: everything at or before len-10-1 is
        // considered already played.
        queue[queue.len() - 11].order_index
    } else {
        f64::NEG_INFINITY
    }
}
