//! BEP 47 per-file attribute flags.
//!
//! The `attr` field of a file entry is a byte string where each byte is
//! a flag character: `p` marks a padding file, `x` an executable, `l` a
//! symlink and `h` a hidden file. Unknown flags are preserved nowhere
//! and ignored, as the BEP requires.
use std::fmt;

/// The decoded attribute set of one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// `p`: alignment padding, not real content.
    pub padding: bool,
    /// `x`: executable bit set on extraction.
    pub executable: bool,
    /// `l`: the entry is a symbolic link; its target is in
    /// `symlink path`.
    pub symlink: bool,
    /// `h`: hidden file.
    pub hidden: bool,
}

impl FileAttributes {
    /// Decodes an `attr` byte string, ignoring unknown flags.
    #[must_use]
    pub fn from_bytes(attr: &[u8]) -> FileAttributes {
        let mut attributes = FileAttributes::default();
        for flag in attr {
            match flag {
                b'p' => attributes.padding = true,
                b'x' => attributes.executable = true,
                b'l' => attributes.symlink = true,
                b'h' => attributes.hidden = true,
                _ => {}
            }
        }
        attributes
    }

    /// Encodes the set back into an `attr` byte string, or `None` when
    /// no flag is set (the field is omitted entirely).
    #[must_use]
    pub fn to_bytes(self) -> Option<Vec<u8>> {
        let mut attr = Vec::new();
        if self.padding {
            attr.push(b'p');
        }
        if self.executable {
            attr.push(b'x');
        }
        if self.symlink {
            attr.push(b'l');
        }
        if self.hidden {
            attr.push(b'h');
        }
        if attr.is_empty() {
            None
        } else {
            Some(attr)
        }
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        !(self.padding || self.executable || self.symlink || self.hidden)
    }
}

impl fmt::Display for FileAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_bytes() {
            Some(attr) => f.write_str(&String::from_utf8_lossy(&attr)),
            None => f.write_str("-"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FileAttributes;

    #[test]
    fn it_should_decode_every_defined_flag() {
        let attributes = FileAttributes::from_bytes(b"pxlh");

        assert!(attributes.padding);
        assert!(attributes.executable);
        assert!(attributes.symlink);
        assert!(attributes.hidden);
    }

    #[test]
    fn it_should_ignore_unknown_flags() {
        let attributes = FileAttributes::from_bytes(b"zx?");

        assert_eq!(
            attributes,
            FileAttributes {
                executable: true,
                ..FileAttributes::default()
            }
        );
    }

    #[test]
    fn it_should_encode_flags_in_canonical_order() {
        let attributes = FileAttributes {
            padding: true,
            hidden: true,
            ..FileAttributes::default()
        };

        assert_eq!(attributes.to_bytes().unwrap(), b"ph");
    }

    #[test]
    fn it_should_omit_the_field_when_no_flag_is_set() {
        assert_eq!(FileAttributes::default().to_bytes(), None);
        assert!(FileAttributes::default().is_empty());
    }

    #[test]
    fn it_should_round_trip_through_bytes() {
        let attributes = FileAttributes::from_bytes(b"lx");

        assert_eq!(
            FileAttributes::from_bytes(&attributes.to_bytes().unwrap()),
            attributes
        );
    }
}
