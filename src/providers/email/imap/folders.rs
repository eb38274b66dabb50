//! Standard folder resolution.
//!
//! Servers name their special folders differently (`Trash`, `Deleted Items`,
//! `[Gmail]/Trash`, ...). Each standard folder carries an ordered list of name
//! variants; the first variant matching a listed mailbox wins.

use super::ops::MailboxInfo;
use crate::domain::system_labels;

/// Folders every mailbox is expected to have in some form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardFolder {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Junk,
    Archive,
}

impl StandardFolder {
    /// All standard folders.
    pub const ALL: [StandardFolder; 6] = [
        Self::Inbox,
        Self::Sent,
        Self::Drafts,
        Self::Trash,
        Self::Junk,
        Self::Archive,
    ];

    /// Folders searched first when locating a message.
    pub const COMMON: [StandardFolder; 4] = [Self::Inbox, Self::Sent, Self::Drafts, Self::Archive];

    /// Parses a standard folder name or system label id, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "inbox" => Some(Self::Inbox),
            "sent" => Some(Self::Sent),
            "drafts" | "draft" => Some(Self::Drafts),
            "trash" | "bin" => Some(Self::Trash),
            "junk" | "spam" => Some(Self::Junk),
            "archive" => Some(Self::Archive),
            _ => None,
        }
    }

    /// Name variants in preference order.
    pub fn variants(&self) -> &'static [&'static str] {
        match self {
            Self::Inbox => &["INBOX", "Inbox"],
            Self::Sent => &[
                "Sent",
                "Sent Items",
                "Sent Mail",
                "Sent Messages",
                "[Gmail]/Sent Mail",
            ],
            Self::Drafts => &["Drafts", "Draft", "[Gmail]/Drafts"],
            Self::Trash => &[
                "Trash",
                "Deleted Items",
                "Deleted",
                "Deleted Messages",
                "[Gmail]/Trash",
                "Bin",
            ],
            Self::Junk => &[
                "Junk",
                "Spam",
                "Junk E-mail",
                "Junk Email",
                "Bulk Mail",
                "[Gmail]/Spam",
            ],
            Self::Archive => &["Archive", "Archives", "All Mail", "[Gmail]/All Mail"],
        }
    }

    /// Label id this folder answers to in label changes.
    pub fn system_label(&self) -> &'static str {
        match self {
            Self::Inbox => system_labels::INBOX,
            Self::Sent => system_labels::SENT,
            Self::Drafts => system_labels::DRAFT,
            Self::Trash => system_labels::TRASH,
            Self::Junk => system_labels::SPAM,
            Self::Archive => "ARCHIVE",
        }
    }
}

fn matches_variant(mailbox: &MailboxInfo, variant: &str) -> bool {
    if mailbox.name == variant {
        return true;
    }
    if variant == "INBOX" && mailbox.name.eq_ignore_ascii_case("INBOX") {
        return true;
    }
    match mailbox.delimiter.as_deref() {
        Some(delim) if !delim.is_empty() => mailbox.name.ends_with(&format!("{delim}{variant}")),
        _ => false,
    }
}

/// Resolves a standard folder against the listed mailboxes.
///
/// Variants are tried in order and the first that matches any selectable
/// mailbox wins, by exact path or by last path segment.
pub fn resolve_standard(folder: StandardFolder, mailboxes: &[MailboxInfo]) -> Option<String> {
    folder.variants().iter().find_map(|variant| {
        mailboxes
            .iter()
            .filter(|m| !m.no_select)
            .find(|m| matches_variant(m, variant))
            .map(|m| m.name.clone())
    })
}

/// Resolves a folder or standard folder name to a mailbox path.
///
/// Standard names are resolved through their variants; anything else must be
/// an existing mailbox path. `INBOX` always resolves, as IMAP guarantees it.
pub fn resolve_folder(name: &str, mailboxes: &[MailboxInfo]) -> Option<String> {
    if let Some(standard) = StandardFolder::parse(name) {
        return resolve_standard(standard, mailboxes).or_else(|| {
            (standard == StandardFolder::Inbox).then(|| "INBOX".to_string())
        });
    }
    mailboxes
        .iter()
        .find(|m| m.name == name && !m.no_select)
        .map(|m| m.name.clone())
}

/// The standard folder a mailbox path plays, if any.
pub fn standard_role(path: &str, mailboxes: &[MailboxInfo]) -> Option<StandardFolder> {
    StandardFolder::ALL
        .into_iter()
        .find(|folder| resolve_standard(*folder, mailboxes).as_deref() == Some(path))
}

/// Selectable mailboxes in lookup order: common folders first, then the rest
/// in listing order.
pub fn search_order(mailboxes: &[MailboxInfo]) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    for folder in StandardFolder::COMMON {
        if let Some(path) = resolve_folder(folder.system_label(), mailboxes) {
            if !order.contains(&path) {
                order.push(path);
            }
        }
    }
    for mailbox in mailboxes.iter().filter(|m| !m.no_select) {
        if !order.contains(&mailbox.name) {
            order.push(mailbox.name.clone());
        }
    }
    order
}
