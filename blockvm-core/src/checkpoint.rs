use uuid::Uuid;

use crate::block::Block;
use crate::bytecode::Cursor;
use crate::error::CheckpointError;
use crate::types::{now_ms, Capabilities, Pid, Timestamp};
use crate::value::{EnumObj, GuestOption, GuestResult, MapObj, Str, StructObj, Value};

/// Checkpoint magic, "BLKC".
pub const MAGIC: u32 = 0x424C_4B43;
pub const FORMAT_VERSION: u32 = 1;

/// Deepest value nesting the codec will follow.
const MAX_DEPTH: usize = 64;

/// The externalizable state of a block. Restoration produces a scaffold
/// block carrying this metadata; live execution state (call stack, ip) is
/// not captured.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub id: Uuid,
    pub created_at: Timestamp,
    pub pid: Pid,
    pub name: Option<String>,
    pub parent: Pid,
    pub capabilities: Capabilities,
    pub links: Vec<Pid>,
    pub reductions: u64,
    pub msgs_sent: u64,
    pub msgs_received: u64,
    pub globals: Vec<(String, Value)>,
}

/// Serializes a block's externalizable state into a typed byte buffer and
/// back. Every variable-length field is length-tagged and bounds-checked
/// on the way in.
pub struct CheckpointManager;

impl CheckpointManager {
    /// Capture `block`. The block must be parked or dead; a Running
    /// block's VM belongs to its worker.
    pub fn checkpoint(block: &Block) -> Result<Vec<u8>, CheckpointError> {
        use std::sync::atomic::Ordering;

        let vm = unsafe { block.vm_mut() };
        let mut out = Vec::with_capacity(256);
        put_u32(&mut out, MAGIC);
        put_u32(&mut out, FORMAT_VERSION);
        put_u64(&mut out, now_ms());
        out.extend_from_slice(Uuid::now_v7().as_bytes());
        put_u64(&mut out, block.pid().as_u64());
        match block.name() {
            Some(name) => {
                out.push(1);
                put_u32(&mut out, name.len() as u32);
                out.extend_from_slice(name.as_bytes());
            }
            None => out.push(0),
        }
        put_u64(&mut out, block.parent().as_u64());
        put_u32(&mut out, block.caps().bits());
        let links = block.links();
        put_u32(&mut out, links.len() as u32);
        for pid in &links {
            put_u64(&mut out, pid.as_u64());
        }
        put_u64(&mut out, block.reductions.load(Ordering::Relaxed));
        put_u64(&mut out, block.msgs_sent.load(Ordering::Relaxed));
        put_u64(&mut out, block.msgs_received.load(Ordering::Relaxed));

        let mut globals: Vec<(&String, &Value)> = vm.globals.iter().collect();
        globals.sort_by(|a, b| a.0.cmp(b.0));
        put_u32(&mut out, globals.len() as u32);
        for (name, value) in globals {
            put_u32(&mut out, name.len() as u32);
            out.extend_from_slice(name.as_bytes());
            write_value(&mut out, value, 0)?;
        }
        Ok(out)
    }

    /// Parse a checkpoint buffer, refusing malformed input.
    pub fn restore(buf: &[u8]) -> Result<Checkpoint, CheckpointError> {
        let mut cur = Cursor::new(buf);
        let magic = read_u32(&mut cur)?;
        if magic != MAGIC {
            return Err(CheckpointError::BadMagic(magic));
        }
        let version = read_u32(&mut cur)?;
        if version > FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(version));
        }
        let created_at = read_u64(&mut cur)?;
        let id_bytes: [u8; 16] = read_bytes(&mut cur, 16)?
            .try_into()
            .map_err(|_| CheckpointError::Truncated)?;
        let id = Uuid::from_bytes(id_bytes);
        let pid = Pid(read_u64(&mut cur)?);
        let name = match read_u8(&mut cur)? {
            0 => None,
            _ => {
                let len = read_u32(&mut cur)? as usize;
                let bytes = read_bytes(&mut cur, len)?;
                Some(
                    std::str::from_utf8(bytes)
                        .map_err(|_| CheckpointError::BadUtf8)?
                        .to_string(),
                )
            }
        };
        let parent = Pid(read_u64(&mut cur)?);
        let capabilities = Capabilities::from_bits_truncate(read_u32(&mut cur)?);
        let link_count = read_u32(&mut cur)? as usize;
        require(&cur, link_count.checked_mul(8).ok_or(CheckpointError::Truncated)?)?;
        let mut links = Vec::with_capacity(link_count);
        for _ in 0..link_count {
            links.push(Pid(read_u64(&mut cur)?));
        }
        let reductions = read_u64(&mut cur)?;
        let msgs_sent = read_u64(&mut cur)?;
        let msgs_received = read_u64(&mut cur)?;
        let global_count = read_u32(&mut cur)? as usize;
        let mut globals = Vec::new();
        for _ in 0..global_count {
            let len = read_u32(&mut cur)? as usize;
            let bytes = read_bytes(&mut cur, len)?;
            let name = std::str::from_utf8(bytes)
                .map_err(|_| CheckpointError::BadUtf8)?
                .to_string();
            let value = read_value(&mut cur, 0)?;
            globals.push((name, value));
        }
        Ok(Checkpoint {
            id,
            created_at,
            pid,
            name,
            parent,
            capabilities,
            links,
            reductions,
            msgs_sent,
            msgs_received,
            globals,
        })
    }
}

// ─── Value codec ──────────────────────────────────────────────

fn write_value(out: &mut Vec<u8>, v: &Value, depth: usize) -> Result<(), CheckpointError> {
    if depth > MAX_DEPTH {
        return Err(CheckpointError::TooDeep);
    }
    match v {
        Value::Nil => out.push(0),
        Value::Bool(b) => {
            out.push(1);
            out.push(u8::from(*b));
        }
        Value::Int(i) => {
            out.push(2);
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Float(f) => {
            out.push(3);
            out.extend_from_slice(&f.to_bits().to_be_bytes());
        }
        Value::Str(s) => {
            out.push(4);
            put_u32(out, s.len() as u32);
            out.extend_from_slice(s.as_str().as_bytes());
        }
        Value::Bytes(b) => {
            out.push(5);
            put_u32(out, b.len() as u32);
            out.extend_from_slice(b);
        }
        Value::Pid(p) => {
            out.push(6);
            put_u64(out, p.as_u64());
        }
        Value::Array(a) => {
            out.push(7);
            put_u32(out, a.items.len() as u32);
            for item in &a.items {
                write_value(out, item, depth + 1)?;
            }
        }
        Value::Map(m) => {
            out.push(8);
            put_u32(out, m.len() as u32);
            for (k, val) in m.entries() {
                put_u32(out, k.len() as u32);
                out.extend_from_slice(k.as_str().as_bytes());
                write_value(out, val, depth + 1)?;
            }
        }
        Value::Struct(s) => {
            out.push(9);
            put_u32(out, s.name.len() as u32);
            out.extend_from_slice(s.name.as_str().as_bytes());
            put_u32(out, s.fields.len() as u32);
            for (k, val) in &s.fields {
                put_u32(out, k.len() as u32);
                out.extend_from_slice(k.as_str().as_bytes());
                write_value(out, val, depth + 1)?;
            }
        }
        Value::Enum(e) => {
            out.push(10);
            put_u32(out, e.enum_name.len() as u32);
            out.extend_from_slice(e.enum_name.as_str().as_bytes());
            put_u32(out, e.variant.len() as u32);
            out.extend_from_slice(e.variant.as_str().as_bytes());
            match &e.payload {
                Some(p) => {
                    out.push(1);
                    write_value(out, p, depth + 1)?;
                }
                None => out.push(0),
            }
        }
        Value::Result(r) => {
            match r.as_ref() {
                GuestResult::Ok(v) => {
                    out.push(11);
                    write_value(out, v, depth + 1)?;
                }
                GuestResult::Err(v) => {
                    out.push(12);
                    write_value(out, v, depth + 1)?;
                }
            };
        }
        Value::Option(o) => match o.as_ref() {
            GuestOption::Some(v) => {
                out.push(13);
                write_value(out, v, depth + 1)?;
            }
            GuestOption::None => out.push(14),
        },
        Value::Function(_) => return Err(CheckpointError::Unserializable("function")),
        Value::Closure(_) => return Err(CheckpointError::Unserializable("closure")),
    }
    Ok(())
}

fn read_value(cur: &mut Cursor<'_>, depth: usize) -> Result<Value, CheckpointError> {
    if depth > MAX_DEPTH {
        return Err(CheckpointError::TooDeep);
    }
    match read_u8(cur)? {
        0 => Ok(Value::Nil),
        1 => Ok(Value::Bool(read_u8(cur)? != 0)),
        2 => {
            let bytes = read_bytes(cur, 8)?;
            Ok(Value::Int(i64::from_be_bytes(
                bytes.try_into().map_err(|_| CheckpointError::Truncated)?,
            )))
        }
        3 => {
            let bytes = read_bytes(cur, 8)?;
            Ok(Value::Float(f64::from_bits(u64::from_be_bytes(
                bytes.try_into().map_err(|_| CheckpointError::Truncated)?,
            ))))
        }
        4 => Ok(Value::str(read_string(cur)?)),
        5 => {
            let len = read_u32(cur)? as usize;
            let bytes = read_bytes(cur, len)?;
            Ok(Value::Bytes(std::sync::Arc::new(bytes.to_vec())))
        }
        6 => Ok(Value::Pid(Pid(read_u64(cur)?))),
        7 => {
            let count = read_u32(cur)? as usize;
            require(cur, count)?;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(read_value(cur, depth + 1)?);
            }
            Ok(Value::array(items))
        }
        8 => {
            let count = read_u32(cur)? as usize;
            require(cur, count)?;
            let mut map = MapObj::new();
            for _ in 0..count {
                let key = read_string(cur)?;
                let val = read_value(cur, depth + 1)?;
                map.set(Str::new(key), val);
            }
            Ok(Value::map(map))
        }
        9 => {
            let name = read_string(cur)?;
            let count = read_u32(cur)? as usize;
            require(cur, count)?;
            let mut fields = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                let key = read_string(cur)?;
                let val = read_value(cur, depth + 1)?;
                fields.push((Str::new(key), val));
            }
            Ok(Value::Struct(std::sync::Arc::new(StructObj {
                name: Str::new(name),
                fields,
            })))
        }
        10 => {
            let enum_name = read_string(cur)?;
            let variant = read_string(cur)?;
            let payload = match read_u8(cur)? {
                0 => None,
                _ => Some(read_value(cur, depth + 1)?),
            };
            Ok(Value::Enum(std::sync::Arc::new(EnumObj {
                enum_name: Str::new(enum_name),
                variant: Str::new(variant),
                payload,
            })))
        }
        11 => Ok(Value::ok(read_value(cur, depth + 1)?)),
        12 => Ok(Value::err(read_value(cur, depth + 1)?)),
        13 => Ok(Value::some(read_value(cur, depth + 1)?)),
        14 => Ok(Value::none()),
        tag => Err(CheckpointError::BadValueTag(tag)),
    }
}

// ─── Cursor shims ─────────────────────────────────────────────

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn read_u8(cur: &mut Cursor<'_>) -> Result<u8, CheckpointError> {
    cur.read_u8().map_err(|_| CheckpointError::Truncated)
}

fn read_u32(cur: &mut Cursor<'_>) -> Result<u32, CheckpointError> {
    cur.read_u32().map_err(|_| CheckpointError::Truncated)
}

fn read_u64(cur: &mut Cursor<'_>) -> Result<u64, CheckpointError> {
    cur.read_u64().map_err(|_| CheckpointError::Truncated)
}

fn read_bytes<'a>(cur: &mut Cursor<'a>, n: usize) -> Result<&'a [u8], CheckpointError> {
    cur.read_bytes(n).map_err(|_| CheckpointError::Truncated)
}

fn read_string(cur: &mut Cursor<'_>) -> Result<String, CheckpointError> {
    let len = read_u32(cur)? as usize;
    let bytes = read_bytes(cur, len)?;
    Ok(std::str::from_utf8(bytes)
        .map_err(|_| CheckpointError::BadUtf8)?
        .to_string())
}

fn require(cur: &Cursor<'_>, n: usize) -> Result<(), CheckpointError> {
    cur.require(n).map_err(|_| CheckpointError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Bytecode;
    use crate::types::ResourceLimits;
    use crate::vm::Vm;
    use std::sync::Arc;

    fn parked_block() -> Block {
        let mut vm = Vm::new(Arc::new(Bytecode::new()));
        vm.set_global("count", Value::Int(3));
        vm.set_global(
            "peers",
            Value::array(vec![Value::Pid(Pid(4)), Value::Pid(Pid(5))]),
        );
        let b = Block::new(
            Pid(2),
            Some("keeper".to_string()),
            Pid(1),
            Capabilities::standard() | Capabilities::TRAP_EXIT,
            ResourceLimits::default(),
            vm,
        );
        b.link(Pid(7));
        b.link(Pid(3));
        b
    }

    #[test]
    fn round_trip_preserves_metadata() {
        let block = parked_block();
        let bytes = CheckpointManager::checkpoint(&block).unwrap();
        let cp = CheckpointManager::restore(&bytes).unwrap();
        assert_eq!(cp.pid, Pid(2));
        assert_eq!(cp.name.as_deref(), Some("keeper"));
        assert_eq!(cp.parent, Pid(1));
        assert!(cp.capabilities.contains(Capabilities::TRAP_EXIT));
        assert_eq!(cp.links, vec![Pid(3), Pid(7)]);
        let count = cp
            .globals
            .iter()
            .find(|(n, _)| n == "count")
            .map(|(_, v)| v)
            .unwrap();
        assert!(count.equals(&Value::Int(3)));
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let block = parked_block();
        let mut bytes = CheckpointManager::checkpoint(&block).unwrap();
        bytes[0] = 0;
        assert!(matches!(
            CheckpointManager::restore(&bytes),
            Err(CheckpointError::BadMagic(_))
        ));

        let bytes = CheckpointManager::checkpoint(&block).unwrap();
        assert!(matches!(
            CheckpointManager::restore(&bytes[..bytes.len() - 3]),
            Err(CheckpointError::Truncated)
        ));
    }

    #[test]
    fn rejects_oversize_link_count() {
        let block = parked_block();
        let bytes = CheckpointManager::checkpoint(&block).unwrap();
        // The link count sits after magic/version/ts/id/pid/name/parent/caps.
        // Corrupt it to something absurd.
        let name_len = "keeper".len();
        let off = 4 + 4 + 8 + 16 + 8 + 1 + 4 + name_len + 8 + 4;
        let mut bad = bytes.clone();
        bad[off..off + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            CheckpointManager::restore(&bad),
            Err(CheckpointError::Truncated)
        ));
    }

    #[test]
    fn closures_are_not_externalizable() {
        let mut vm = Vm::new(Arc::new(Bytecode::new()));
        vm.set_global(
            "f",
            Value::Closure(Arc::new(crate::value::ClosureObj {
                function: 0,
                upvalues: vec![],
            })),
        );
        let b = Block::new(
            Pid(2),
            None,
            Pid::INVALID,
            Capabilities::standard(),
            ResourceLimits::default(),
            vm,
        );
        assert!(matches!(
            CheckpointManager::checkpoint(&b),
            Err(CheckpointError::Unserializable("closure"))
        ));
    }

    #[test]
    fn nested_value_round_trip() {
        let mut vm = Vm::new(Arc::new(Bytecode::new()));
        let mut inner = MapObj::new();
        inner.set(Str::new("ok"), Value::ok(Value::some(Value::Int(1))));
        vm.set_global("state", Value::map(inner));
        let b = Block::new(
            Pid(2),
            None,
            Pid::INVALID,
            Capabilities::standard(),
            ResourceLimits::default(),
            vm,
        );
        let cp = CheckpointManager::restore(&CheckpointManager::checkpoint(&b).unwrap()).unwrap();
        let state = &cp.globals[0].1;
        let v = state.map_get(&Value::str("ok")).unwrap();
        assert!(v.equals(&Value::ok(Value::some(Value::Int(1)))));
    }
}
