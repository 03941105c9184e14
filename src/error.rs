use core::fmt::Display;
use std::borrow::Cow;

/// Error types used throughout the `arm-rtld` library.
///
/// Every public operation that fails returns one of these; the textual
/// form of the first failure in a call sequence is additionally latched
/// on the loader instance and can be fetched through
/// [`Rtld::dlerror`](crate::Rtld::dlerror).
#[derive(Debug)]
pub enum Error {
    /// An error occurred while opening or reading a shared object file.
    Io {
        /// A descriptive message about the I/O error.
        msg: Cow<'static, str>,
    },

    /// An address-space reservation or kernel memory-block allocation failed.
    Alloc {
        /// A descriptive message about the allocation error.
        msg: Cow<'static, str>,
    },

    /// The image is not a loadable ELF32/ARM shared object.
    ///
    /// Covers bad magic, wrong file type/class/machine, malformed program
    /// or section headers, and missing `DYNAMIC` or symbol-table sections.
    ParseElf {
        /// A descriptive message about the format error.
        msg: Cow<'static, str>,
    },

    /// A relocation pass failed.
    ///
    /// Covers unresolved non-weak symbols, unknown relocation types and
    /// unsupported PLT relocation styles.
    Relocate {
        /// A descriptive message about the relocation error.
        msg: Cow<'static, str>,
    },

    /// A symbol was not found in the searched module(s).
    FindSymbol {
        /// A descriptive message about the failed lookup.
        msg: Cow<'static, str>,
    },

    /// A caller-supplied argument was unusable (empty name, empty export
    /// table, ...).
    InvalidArgument {
        /// A descriptive message about the argument.
        msg: Cow<'static, str>,
    },

    /// A handle or base address did not refer to any loaded module.
    UnknownHandle {
        /// A descriptive message about the lookup.
        msg: Cow<'static, str>,
    },

    /// A required host capability is absent or failed to initialize.
    MissingCapability {
        /// A descriptive message about the capability.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Io { msg } => write!(f, "I/O error: {msg}"),
            Error::Alloc { msg } => write!(f, "allocation error: {msg}"),
            Error::ParseElf { msg } => write!(f, "ELF parsing error: {msg}"),
            Error::Relocate { msg } => write!(f, "relocation error: {msg}"),
            Error::FindSymbol { msg } => write!(f, "symbol lookup error: {msg}"),
            Error::InvalidArgument { msg } => write!(f, "invalid argument: {msg}"),
            Error::UnknownHandle { msg } => write!(f, "unknown handle: {msg}"),
            Error::MissingCapability { msg } => write!(f, "missing capability: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

#[cold]
#[inline(never)]
pub(crate) fn io_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Io { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn alloc_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Alloc { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn parse_elf_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParseElf { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn relocate_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Relocate { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn find_symbol_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::FindSymbol { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn invalid_argument_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::InvalidArgument { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn unknown_handle_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::UnknownHandle { msg: msg.into() }
}

#[cold]
#[inline(never)]
pub(crate) fn missing_capability_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::MissingCapability { msg: msg.into() }
}

pub type Result<T> = core::result::Result<T, Error>;
