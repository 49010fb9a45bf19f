//! Per-channel nick rosters.
//!
//! Channels are keyed case-insensitively; nicks are stored exactly as the
//! server last reported them. Rosters are `BTreeSet`s so every snapshot comes
//! out in the same (lexicographic) order and consumers can diff them without
//! false churn.

use std::collections::{BTreeSet, HashMap};

/// A channel whose roster just changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterUpdate {
    /// Display-case channel name.
    pub channel: String,
    /// Sorted nicks.
    pub nicks: Vec<String>,
}

#[derive(Debug, Default)]
struct Channel {
    display: String,
    nicks: BTreeSet<String>,
}

impl Channel {
    fn update(&self) -> RosterUpdate {
        RosterUpdate {
            channel: self.display.clone(),
            nicks: self.nicks.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MembershipTracker {
    channels: HashMap<String, Channel>,
}

fn key(channel: &str) -> String {
    channel.to_lowercase()
}

impl MembershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel_mut(&mut self, channel: &str) -> &mut Channel {
        let entry = self.channels.entry(key(channel)).or_default();
        entry.display = channel.to_string();
        entry
    }

    /// Replace a channel's roster (NAMES). Always reports the new roster.
    pub fn set_roster<I, S>(&mut self, channel: &str, nicks: I) -> RosterUpdate
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.channel_mut(channel);
        entry.nicks = nicks.into_iter().map(Into::into).collect();
        entry.update()
    }

    /// Add nicks to a roster (continuation of a multi-line NAMES reply).
    pub fn extend<I, S>(&mut self, channel: &str, nicks: I) -> RosterUpdate
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entry = self.channel_mut(channel);
        entry.nicks.extend(nicks.into_iter().map(Into::into));
        entry.update()
    }

    /// Add one nick (JOIN). `None` when it was already present.
    pub fn add(&mut self, channel: &str, nick: &str) -> Option<RosterUpdate> {
        let entry = self.channel_mut(channel);
        entry.nicks.insert(nick.to_string()).then(|| entry.update())
    }

    /// Remove one nick (PART, KICK). `None` when it wasn't there.
    pub fn remove(&mut self, channel: &str, nick: &str) -> Option<RosterUpdate> {
        let entry = self.channels.get_mut(&key(channel))?;
        entry.nicks.remove(nick).then(|| entry.update())
    }

    /// Rename a nick in every channel it is in (NICK).
    pub fn rename(&mut self, old: &str, new: &str) -> Vec<RosterUpdate> {
        if old == new {
            return Vec::new();
        }
        let mut updates = Vec::new();
        for entry in self.channels.values_mut() {
            if entry.nicks.remove(old) {
                entry.nicks.insert(new.to_string());
                updates.push(entry.update());
            }
        }
        updates.sort_by(|a, b| a.channel.cmp(&b.channel));
        updates
    }

    /// Remove a nick from every channel (QUIT).
    pub fn remove_everywhere(&mut self, nick: &str) -> Vec<RosterUpdate> {
        let mut updates: Vec<_> = self
            .channels
            .values_mut()
            .filter_map(|entry| entry.nicks.remove(nick).then(|| entry.update()))
            .collect();
        updates.sort_by(|a, b| a.channel.cmp(&b.channel));
        updates
    }

    /// Forget a channel entirely.
    pub fn remove_channel(&mut self, channel: &str) -> bool {
        self.channels.remove(&key(channel)).is_some()
    }

    pub fn clear_all(&mut self) {
        self.channels.clear();
    }

    /// Sorted snapshot of a channel's roster.
    pub fn roster(&self, channel: &str) -> Option<Vec<String>> {
        self.channels
            .get(&key(channel))
            .map(|entry| entry.nicks.iter().cloned().collect())
    }

    /// Display names of every tracked channel, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<_> = self.channels.values().map(|c| c.display.clone()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
