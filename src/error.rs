use alloc::borrow::Cow;
use alloc::string::String;
use core::fmt::{Debug, Display};

/// Error types used throughout the `rtld_core` library.
/// These errors represent the failure conditions that can occur while
/// resolving symbols and setting up thread-local storage.
#[derive(Debug)]
pub enum Error {
    /// A strong reference could not be resolved in any searched scope.
    ///
    /// Weak references that stay unresolved are not an error; they resolve
    /// to a null result instead.
    UndefinedSymbol {
        /// Name of the unresolved symbol.
        name: String,
        /// Name of the object that contains the reference.
        referer: String,
        /// Version the reference asked for, if any.
        version: Option<String>,
    },

    /// A versioned reference reached the object named by its version
    /// requirement without finding a matching definition.
    VersionMismatch {
        /// Name of the symbol being resolved.
        name: String,
        /// The required version string.
        version: String,
        /// The object that was expected to define the version.
        file: String,
        /// Name of the object that contains the reference.
        referer: String,
        /// True when the defining object carries no version records at all,
        /// which usually means it is an older build of the library.
        no_version_records: bool,
    },

    /// An error occurred while parsing a symbol hash section.
    ///
    /// This error typically indicates a malformed `.gnu.hash` or `.hash`
    /// section such as:
    /// * A truncated header or table body
    /// * A bitmask word count that is not a power of two
    /// * Bucket entries pointing past the symbol table
    ParseHash {
        /// A descriptive message about the hash section parsing error.
        msg: Cow<'static, str>,
    },

    /// A TLS tunable or static-layout parameter failed validation.
    Tls {
        /// A descriptive message about the TLS configuration error.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::UndefinedSymbol {
                name,
                referer,
                version,
            } => match version {
                Some(version) => write!(
                    f,
                    "{referer}: undefined symbol: {name}, version {version}"
                ),
                None => write!(f, "{referer}: undefined symbol: {name}"),
            },
            Error::VersionMismatch {
                name,
                version,
                file,
                referer,
                no_version_records,
            } => {
                if *no_version_records {
                    write!(
                        f,
                        "{referer}: symbol {name}: no version information available (required by {file})"
                    )
                } else {
                    write!(
                        f,
                        "{referer}: symbol {name}: version {version} not defined in file {file} with link time reference"
                    )
                }
            }
            Error::ParseHash { msg } => write!(f, "Hash section parsing error: {msg}"),
            Error::Tls { msg } => write!(f, "TLS configuration error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

/// Creates an undefined-symbol error.
///
/// # Arguments
/// * `name` - The unresolved symbol name.
/// * `referer` - The object containing the reference.
/// * `version` - The requested version, if the reference was versioned.
///
/// # Returns
/// An `Error::UndefinedSymbol` variant.
#[cold]
#[inline(never)]
pub(crate) fn undefined_symbol_error(
    name: impl Into<String>,
    referer: impl Into<String>,
    version: Option<String>,
) -> Error {
    Error::UndefinedSymbol {
        name: name.into(),
        referer: referer.into(),
        version,
    }
}

/// Creates a version-mismatch error.
///
/// # Returns
/// An `Error::VersionMismatch` variant.
#[cold]
#[inline(never)]
pub(crate) fn version_mismatch_error(
    name: impl Into<String>,
    version: impl Into<String>,
    file: impl Into<String>,
    referer: impl Into<String>,
    no_version_records: bool,
) -> Error {
    Error::VersionMismatch {
        name: name.into(),
        version: version.into(),
        file: file.into(),
        referer: referer.into(),
        no_version_records,
    }
}

/// Creates a hash section parsing error with the specified message.
///
/// # Arguments
/// * `msg` - The error message.
///
/// # Returns
/// An `Error::ParseHash` variant with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn parse_hash_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::ParseHash { msg: msg.into() }
}

/// Creates a TLS configuration error with the specified message.
///
/// # Arguments
/// * `msg` - The error message.
///
/// # Returns
/// An `Error::Tls` variant with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn tls_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Tls { msg: msg.into() }
}
