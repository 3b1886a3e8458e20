//! Authenticated identity of a session.
//!
//! `SessionCredentials` is capability-bearing: holding one means the
//! authentication already happened. It serializes for diagnostics but is
//! deliberately not `Deserialize`; reconstructing credentials from untrusted
//! bytes is not a supported path.

use serde::Serialize;
use std::collections::HashSet;

/// Client-compatibility quirks requested through a username suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EnabledHack {
    /// `/wm`: web-mail client, folder names are not UTF-7 encoded.
    WmSplit,
    /// `/tb`: Thunderbird quirks.
    Thunderbird,
    /// `/ni`: suppress unsolicited notifications while idle.
    NoIdleNotifications,
}

impl EnabledHack {
    fn from_suffix(suffix: &str) -> Option<EnabledHack> {
        match suffix {
            "wm" => Some(EnabledHack::WmSplit),
            "tb" => Some(EnabledHack::Thunderbird),
            "ni" => Some(EnabledHack::NoIdleNotifications),
            _ => None,
        }
    }
}

/// Where the account's mailbox data lives relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoreLocality {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionCredentials {
    account_id: String,
    username: String,
    locality: StoreLocality,
    hacks: HashSet<EnabledHack>,
    subscriptions: HashSet<String>,
    hidden_folders: HashSet<String>,
}

impl SessionCredentials {
    /// Build credentials from a login name. A trailing `/wm`, `/tb`, or
    /// `/ni` enables the matching hack and is stripped from the username;
    /// unknown suffixes stay part of the name.
    pub fn new<A: Into<String>>(account_id: A, login_name: &str, locality: StoreLocality) -> Self {
        let mut hacks = HashSet::new();
        let mut username = login_name;
        while let Some((stem, suffix)) = username.rsplit_once('/') {
            match EnabledHack::from_suffix(suffix) {
                Some(hack) => {
                    hacks.insert(hack);
                    username = stem;
                }
                None => break,
            }
        }
        SessionCredentials {
            account_id: account_id.into(),
            username: username.to_string(),
            locality,
            hacks,
            subscriptions: HashSet::new(),
            hidden_folders: HashSet::new(),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_local(&self) -> bool {
        self.locality == StoreLocality::Local
    }

    pub fn has_hack(&self, hack: EnabledHack) -> bool {
        self.hacks.contains(&hack)
    }

    pub fn subscribe(&mut self, folder: &str) {
        self.subscriptions.insert(folder.to_string());
    }

    pub fn unsubscribe(&mut self, folder: &str) {
        self.subscriptions.remove(folder);
    }

    pub fn is_subscribed(&self, folder: &str) -> bool {
        self.subscriptions.contains(folder)
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(String::as_str)
    }

    pub fn hide_folder(&mut self, folder: &str) {
        self.hidden_folders.insert(folder.to_string());
    }

    pub fn is_hidden(&self, folder: &str) -> bool {
        self.hidden_folders.contains(folder)
    }
}
