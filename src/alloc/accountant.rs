//! Per-project live byte totals. A fixed table, so crediting never
//! allocates. It runs under the registry lock.

use serde::Serialize;

use super::record::ProjectTag;

/// Number of distinct projects tracked before everything else is lumped
/// into [`OVERFLOW_PROJECT`].
pub const MAX_PROJECTS: usize = 64;
pub const OVERFLOW_PROJECT: &str = "<other>";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ProjectAccount {
    pub name: ProjectTag,
    pub live_bytes: usize,
    pub live_count: usize,
    pub peak_bytes: usize,
    pub total_allocations: u64,
}

impl ProjectAccount {
    const fn empty() -> Self {
        Self {
            name: ProjectTag::empty(),
            live_bytes: 0,
            live_count: 0,
            peak_bytes: 0,
            total_allocations: 0,
        }
    }
}

pub struct Accounts {
    accounts: [ProjectAccount; MAX_PROJECTS],
    len: usize,
    overflow: ProjectAccount,
}

impl Accounts {
    pub const fn new() -> Self {
        Self {
            accounts: [ProjectAccount::empty(); MAX_PROJECTS],
            len: 0,
            overflow: ProjectAccount::empty(),
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.accounts[..self.len]
            .iter()
            .position(|account| account.name.as_str() == name)
    }

    /// The account for `name`, created on first use.
    fn entry(&mut self, name: &ProjectTag) -> &mut ProjectAccount {
        if let Some(i) = self.find(name.as_str()) {
            return &mut self.accounts[i];
        }
        if self.len < MAX_PROJECTS {
            let i = self.len;
            self.len += 1;
            self.accounts[i].name = *name;
            &mut self.accounts[i]
        } else {
            if self.overflow.name.is_empty() {
                self.overflow.name = ProjectTag::new(OVERFLOW_PROJECT);
            }
            &mut self.overflow
        }
    }

    pub fn credit(&mut self, name: &ProjectTag, size: usize) {
        let account = self.entry(name);
        account.live_bytes += size;
        account.live_count += 1;
        account.total_allocations += 1;
        account.peak_bytes = account.peak_bytes.max(account.live_bytes);
    }

    pub fn debit(&mut self, name: &ProjectTag, size: usize) {
        let account = self.entry(name);
        account.live_bytes = account.live_bytes.saturating_sub(size);
        account.live_count = account.live_count.saturating_sub(1);
    }

    /// Live bytes for `name`, `0` if it never allocated. `name` is cut down
    /// to a [`ProjectTag`] first, the same way it was when it was credited.
    pub fn query(&self, name: &str) -> usize {
        let name = ProjectTag::new(name);
        match self.find(name.as_str()) {
            Some(i) => self.accounts[i].live_bytes,
            None if name.as_str() == OVERFLOW_PROJECT => self.overflow.live_bytes,
            None => 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProjectAccount> {
        let overflow = (!self.overflow.name.is_empty()).then_some(&self.overflow);
        self.accounts[..self.len].iter().chain(overflow)
    }
}

impl Default for Accounts {
    fn default() -> Self {
        Self::new()
    }
}
