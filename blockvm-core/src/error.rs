use thiserror::Error;

/// Errors an opcode can produce. Any of these ends the executing block
/// with the named reason; they are never raised as panics.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VmError {
    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("type error: expected {expected}, got {got}")]
    Type { expected: String, got: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("index {index} out of bounds (len {len})")]
    OutOfBounds { index: i64, len: usize },

    #[error("jump target {target} outside code (len {len})")]
    JumpOutOfBounds { target: usize, len: usize },

    #[error("undefined variable: {0}")]
    UndefinedVariable(String),

    #[error("arity mismatch: expected {expected}, got {got}")]
    Arity { expected: u8, got: u8 },

    #[error("missing capability: {0}")]
    Capability(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("stack overflow")]
    StackOverflow,

    #[error("heap limit exceeded")]
    HeapLimit,

    #[error("stack underflow")]
    StackUnderflow,

    #[error("not implemented: {0}")]
    NotImplemented(String),
}

/// Why a message could not be delivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("no block with pid {0}")]
    UnknownPid(u64),

    #[error("no block registered under name {0:?}")]
    UnknownName(String),

    #[error("target mailbox is full")]
    MailboxFull,

    #[error("target block is dead")]
    DeadTarget,
}

/// Why a spawn was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpawnError {
    #[error("block limit reached")]
    MaxBlocks,

    #[error("name {0:?} is already registered")]
    NameTaken(String),

    #[error("invalid entry point")]
    InvalidEntry,
}

/// Malformed bytecode input. The deserializer refuses anything it cannot
/// prove in-bounds before touching it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("invalid magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("declared code size {0} exceeds limit")]
    CodeTooLarge(u64),

    #[error("declared constant count {0} exceeds limit")]
    TooManyConstants(u64),

    #[error("input truncated")]
    Truncated,

    #[error("unknown value tag {0}")]
    BadValueTag(u8),

    #[error("unknown opcode 0x{0:02x} at offset {1}")]
    BadOpcode(u8, usize),

    #[error("string is not valid utf-8")]
    BadUtf8,

    #[error("jump offset overflows 16 bits")]
    JumpTooFar,

    #[error("constant of kind {0} cannot be serialized")]
    UnserializableConst(&'static str),
}

/// Corrupted or over-size checkpoint input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("invalid checkpoint magic 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),

    #[error("checkpoint truncated")]
    Truncated,

    #[error("unknown value tag {0}")]
    BadValueTag(u8),

    #[error("value nesting exceeds limit")]
    TooDeep,

    #[error("value of this kind cannot be externalized: {0}")]
    Unserializable(&'static str),

    #[error("string is not valid utf-8")]
    BadUtf8,
}

/// Name-table and group-table failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("name {0:?} is already registered")]
    NameTaken(String),

    #[error("name {0:?} is not registered")]
    NameNotFound(String),
}
