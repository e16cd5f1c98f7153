//! Compiled program model.
//!
//! A compiled program arrives as two streams: the program image (functions,
//! type declarations, entry point) and its debug symbols. Both are framed by a
//! four byte magic and a format version, followed by a bincode payload.

mod builder;
mod edit;
mod instr;
mod symbols;

pub use builder::{FunctionBuilder, Label, ProgramBuilder};
pub use edit::{edit_function, Emitter};
pub use instr::{AllocationKind, FunctionId, GuardCheck, Instr, ValueType};
pub use symbols::{FunctionSymbols, LineEntry, SymbolMap};

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magic prefix of a program image stream
pub const IMAGE_MAGIC: [u8; 4] = *b"TBXP";

/// Magic prefix of a symbol stream
pub const SYMBOLS_MAGIC: [u8; 4] = *b"TBXS";

/// Current stream format version
pub const FORMAT_VERSION: u16 = 1;

/// Structural program errors
#[derive(Debug, Error)]
pub enum ProgramError {
    /// Stream could not be read
    #[error("failed to read {stream} stream: {source}")]
    Io {
        /// Which stream failed
        stream: &'static str,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Stream does not start with the expected magic
    #[error("{stream} stream has an invalid header")]
    BadMagic {
        /// Which stream failed
        stream: &'static str,
    },
    /// Stream was written by an unknown format version
    #[error("{stream} stream has unsupported format version {version}")]
    UnsupportedVersion {
        /// Which stream failed
        stream: &'static str,
        /// Version found in the header
        version: u16,
    },
    /// Payload could not be decoded
    #[error("failed to decode {stream} stream: {message}")]
    Decode {
        /// Which stream failed
        stream: &'static str,
        /// Decoder message
        message: String,
    },
    /// Program could not be encoded
    #[error("failed to encode program: {0}")]
    Encode(String),
}

/// Function signature
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Parameter types, occupying the first locals
    pub params: Vec<ValueType>,
    /// Return type, `None` for void
    pub returns: Option<ValueType>,
}

impl Signature {
    /// A signature with no parameters and no return value
    #[must_use]
    pub const fn void() -> Self {
        Self {
            params: Vec::new(),
            returns: None,
        }
    }
}

/// A function body
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    /// Declared signature
    pub signature: Signature,
    /// Number of local slots, including parameters
    pub locals: u16,
    /// Instructions
    pub body: Vec<Instr>,
}

/// Memory layout of a declared type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeLayout {
    /// Runtime-chosen layout
    Auto,
    /// Fields laid out in declaration order
    Sequential,
    /// Fields placed at explicit offsets (may overlap)
    Explicit,
}

/// A declared type
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDecl {
    /// Type name
    pub name: String,
    /// Declared layout
    pub layout: TypeLayout,
}

/// The executable part of a compiled program
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramImage {
    /// Functions indexed by [`FunctionId`]
    pub functions: Vec<Function>,
    /// Type declarations
    pub types: Vec<TypeDecl>,
    /// Designated entry point
    pub entry_point: Option<FunctionId>,
    /// Set once the guard injector has rewritten the image
    pub guarded: bool,
}

impl ProgramImage {
    /// Function by id
    #[must_use]
    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id as usize)
    }

    /// Encode to a framed image stream
    ///
    /// # Errors
    /// Returns error if encoding or writing fails
    pub fn write_to(&self, writer: impl Write) -> Result<(), ProgramError> {
        write_framed(writer, IMAGE_MAGIC, "program", self)
    }

    /// Encode to framed bytes
    ///
    /// # Errors
    /// Returns error if encoding fails
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProgramError> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    /// Decode from framed bytes
    ///
    /// # Errors
    /// Returns error if the header or payload is invalid
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProgramError> {
        read_framed(bytes, IMAGE_MAGIC, "program")
    }
}

/// A program together with its debug symbols
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompiledProgram {
    /// Executable image
    pub image: ProgramImage,
    /// Debug symbols
    pub symbols: SymbolMap,
}

impl CompiledProgram {
    /// Read a program from its image and symbol streams.
    ///
    /// Both streams are consumed and dropped once read. An empty symbol
    /// stream yields an empty [`SymbolMap`].
    ///
    /// # Errors
    /// Returns error if either stream is unreadable or malformed
    pub fn read(mut image: impl Read, mut symbols: impl Read) -> Result<Self, ProgramError> {
        let mut image_bytes = Vec::new();
        image
            .read_to_end(&mut image_bytes)
            .map_err(|source| ProgramError::Io {
                stream: "program",
                source,
            })?;
        drop(image);

        let mut symbol_bytes = Vec::new();
        symbols
            .read_to_end(&mut symbol_bytes)
            .map_err(|source| ProgramError::Io {
                stream: "symbol",
                source,
            })?;
        drop(symbols);

        let image = ProgramImage::from_bytes(&image_bytes)?;
        let symbols = if symbol_bytes.is_empty() {
            SymbolMap::default()
        } else {
            read_framed(&symbol_bytes, SYMBOLS_MAGIC, "symbol")?
        };

        Ok(Self { image, symbols })
    }

    /// Write the image and symbol streams
    ///
    /// # Errors
    /// Returns error if encoding fails
    pub fn to_streams(&self) -> Result<(Vec<u8>, Vec<u8>), ProgramError> {
        let image = self.image.to_bytes()?;
        let mut symbols = Vec::new();
        write_framed(&mut symbols, SYMBOLS_MAGIC, "symbol", &self.symbols)?;
        Ok((image, symbols))
    }

    /// Resolved entry point
    #[must_use]
    pub fn entry_point(&self) -> Option<(FunctionId, &Function)> {
        let id = self.image.entry_point?;
        self.image.function(id).map(|function| (id, function))
    }
}

/// BLAKE3 fingerprint of an encoded program image
#[must_use]
pub fn fingerprint(image_bytes: &[u8]) -> [u8; 32] {
    *blake3::hash(image_bytes).as_bytes()
}

fn write_framed<T: Serialize>(
    mut writer: impl Write,
    magic: [u8; 4],
    stream: &'static str,
    value: &T,
) -> Result<(), ProgramError> {
    let io = |source| ProgramError::Io { stream, source };
    writer.write_all(&magic).map_err(io)?;
    writer
        .write_all(&FORMAT_VERSION.to_le_bytes())
        .map_err(io)?;
    bincode::serialize_into(&mut writer, value)
        .map_err(|e| ProgramError::Encode(e.to_string()))
}

fn read_framed<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
    magic: [u8; 4],
    stream: &'static str,
) -> Result<T, ProgramError> {
    if bytes.len() < 6 || bytes[..4] != magic {
        return Err(ProgramError::BadMagic { stream });
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(ProgramError::UnsupportedVersion { stream, version });
    }
    bincode::deserialize(&bytes[6..]).map_err(|e| ProgramError::Decode {
        stream,
        message: e.to_string(),
    })
}
