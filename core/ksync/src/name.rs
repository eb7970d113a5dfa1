// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

use core::fmt;

/// Maximum length of an object name, in bytes.
pub const NAME_MAX: usize = kconfig::NAME_MAX;

/// A kernel object name, stored inline and truncated to [`NAME_MAX`] bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct KName {
    buf: [u8; NAME_MAX],
    len: usize,
}

impl KName {
    /// Copies `name`, cutting it at [`NAME_MAX`] bytes without splitting a
    /// UTF-8 sequence.
    pub const fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut len = if bytes.len() > NAME_MAX {
            NAME_MAX
        } else {
            bytes.len()
        };
        while len > 0 && len < bytes.len() && (bytes[len] & 0xc0) == 0x80 {
            len -= 1;
        }
        let mut buf = [0; NAME_MAX];
        let mut i = 0;
        while i < len {
            buf[i] = bytes[i];
            i += 1;
        }
        Self { buf, len }
    }

    /// Returns the name.
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or_default()
    }
}

impl fmt::Debug for KName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for KName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
