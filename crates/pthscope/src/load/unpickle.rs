//! Pickle virtual machine.
//!
//! Executes a pickle opcode stream (protocols 0 to 4) into an [`Object`]
//! tree. Nothing is imported or called: globals stay symbolic, and REDUCE,
//! NEWOBJ and BUILD are recorded for the caller to interpret.
//!
//! Mapping items keep the order in which the stream inserted them.

use std::collections::HashMap;
use std::io::{BufRead, Read};

/// Errors raised while executing a pickle stream.
#[derive(Debug, thiserror::Error)]
pub enum PickleError {
    #[error("truncated pickle stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("unsupported opcode {0}")]
    Unsupported(&'static str),

    #[error("stack underflow at {0}")]
    StackUnderflow(&'static str),

    #[error("no mark on the stack at {0}")]
    MissingMark(&'static str),

    #[error("memo key {0} not found")]
    MissingMemo(u32),

    #[error("{op} expects {expected}, found {found}")]
    Type {
        op: &'static str,
        expected: &'static str,
        found: String,
    },

    #[error("malformed {0} argument")]
    Malformed(&'static str),
}

type Result<T> = std::result::Result<T, PickleError>;

/// A value produced by the pickle stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    /// Integer outside the `i64` range
    BigInt,
    Float(f64),
    Unicode(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Object>),
    /// Lists, and sets flattened to their elements
    List(Vec<Object>),
    /// Key/value pairs in insertion order
    Dict(Vec<(Object, Object)>),
    Class {
        module_name: String,
        class_name: String,
    },
    Reduce {
        callable: Box<Object>,
        args: Box<Object>,
    },
    Build {
        callable: Box<Object>,
        args: Box<Object>,
    },
    PersistentLoad(Box<Object>),
}

impl Object {
    /// Python-style type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::None => "NoneType",
            Object::Bool(_) => "bool",
            Object::Int(_) | Object::BigInt => "int",
            Object::Float(_) => "float",
            Object::Unicode(_) => "str",
            Object::Bytes(_) => "bytes",
            Object::Tuple(_) => "tuple",
            Object::List(_) => "list",
            Object::Dict(_) => "dict",
            Object::Class { .. } => "type",
            Object::Reduce { .. } | Object::Build { .. } => "object",
            Object::PersistentLoad(_) => "storage",
        }
    }
}

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';

    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;

    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
}

/// Stack slot. Values remember the memo key they were stored under so the
/// memo can be refreshed once the value is complete.
enum Entry {
    Mark,
    Value { obj: Object, memo: Option<u32> },
}

#[derive(Default)]
struct Machine {
    stack: Vec<Entry>,
    memo: HashMap<u32, Object>,
}

/// Run a pickle stream to its STOP opcode and return the root object.
pub fn unpickle<R: BufRead>(reader: &mut R) -> Result<Object> {
    let mut machine = Machine::default();
    loop {
        let code = read_u8(reader)?;
        if code == op::STOP {
            break;
        }
        machine.step(code, reader)?;
    }
    match machine.stack.pop() {
        Some(Entry::Value { obj, .. }) => Ok(obj),
        Some(Entry::Mark) => Err(PickleError::Malformed("STOP")),
        None => Err(PickleError::StackUnderflow("STOP")),
    }
}

impl Machine {
    fn step<R: BufRead>(&mut self, code: u8, r: &mut R) -> Result<()> {
        match code {
            op::PROTO => {
                read_u8(r)?;
            }
            op::FRAME => {
                read_array::<8, _>(r)?;
            }
            op::MARK => self.stack.push(Entry::Mark),
            op::POP => {
                self.pop_entry("POP")?;
            }
            op::POP_MARK => {
                self.pop_to_mark("POP_MARK")?;
            }
            op::DUP => {
                let top = self.top_mut("DUP")?.clone();
                self.push(top);
            }

            op::NONE => self.push(Object::None),
            op::NEWTRUE => self.push(Object::Bool(true)),
            op::NEWFALSE => self.push(Object::Bool(false)),
            op::INT => {
                let line = read_line(r)?;
                let obj = match line.as_str() {
                    "00" => Object::Bool(false),
                    "01" => Object::Bool(true),
                    digits => Object::Int(digits.parse().map_err(|_| PickleError::Malformed("INT"))?),
                };
                self.push(obj);
            }
            op::LONG => {
                let line = read_line(r)?;
                let digits = line.trim_end_matches('L');
                let obj = match digits.parse() {
                    Ok(i) => Object::Int(i),
                    Err(_) if !digits.is_empty() && digits.trim_start_matches('-').bytes().all(|b| b.is_ascii_digit()) => {
                        Object::BigInt
                    }
                    Err(_) => return Err(PickleError::Malformed("LONG")),
                };
                self.push(obj);
            }
            op::BININT => self.push(Object::Int(i32::from_le_bytes(read_array(r)?) as i64)),
            op::BININT1 => self.push(Object::Int(read_u8(r)? as i64)),
            op::BININT2 => self.push(Object::Int(u16::from_le_bytes(read_array(r)?) as i64)),
            op::LONG1 => {
                let len = read_u8(r)? as usize;
                self.push(decode_long(&read_bytes(r, len)?));
            }
            op::LONG4 => {
                let len = i32::from_le_bytes(read_array(r)?);
                let len = usize::try_from(len).map_err(|_| PickleError::Malformed("LONG4"))?;
                self.push(decode_long(&read_bytes(r, len)?));
            }
            op::FLOAT => {
                let line = read_line(r)?;
                self.push(Object::Float(line.parse().map_err(|_| PickleError::Malformed("FLOAT"))?));
            }
            op::BINFLOAT => self.push(Object::Float(f64::from_be_bytes(read_array(r)?))),

            op::STRING => {
                let line = read_line(r)?;
                let quoted = line.trim_matches(|c| c == '\'' || c == '"');
                self.push(Object::Unicode(quoted.to_string()));
            }
            op::UNICODE => {
                let line = read_line(r)?;
                self.push(Object::Unicode(line));
            }
            op::BINSTRING => {
                let len = i32::from_le_bytes(read_array(r)?);
                let len = usize::try_from(len).map_err(|_| PickleError::Malformed("BINSTRING"))?;
                let bytes = read_bytes(r, len)?;
                self.push(Object::Unicode(String::from_utf8_lossy(&bytes).into_owned()));
            }
            op::SHORT_BINSTRING => {
                let len = read_u8(r)? as usize;
                let bytes = read_bytes(r, len)?;
                self.push(Object::Unicode(String::from_utf8_lossy(&bytes).into_owned()));
            }
            op::BINUNICODE => {
                let len = u32::from_le_bytes(read_array(r)?) as usize;
                self.push(read_utf8(r, len, "BINUNICODE")?);
            }
            op::SHORT_BINUNICODE => {
                let len = read_u8(r)? as usize;
                self.push(read_utf8(r, len, "SHORT_BINUNICODE")?);
            }
            op::BINUNICODE8 => {
                let len = read_len8(r, "BINUNICODE8")?;
                self.push(read_utf8(r, len, "BINUNICODE8")?);
            }
            op::BINBYTES => {
                let len = u32::from_le_bytes(read_array(r)?) as usize;
                self.push(Object::Bytes(read_bytes(r, len)?));
            }
            op::SHORT_BINBYTES => {
                let len = read_u8(r)? as usize;
                self.push(Object::Bytes(read_bytes(r, len)?));
            }
            op::BINBYTES8 | op::BYTEARRAY8 => {
                let len = read_len8(r, "BINBYTES8")?;
                self.push(Object::Bytes(read_bytes(r, len)?));
            }

            op::EMPTY_DICT => self.push(Object::Dict(Vec::new())),
            op::EMPTY_LIST | op::EMPTY_SET => self.push(Object::List(Vec::new())),
            op::EMPTY_TUPLE => self.push(Object::Tuple(Vec::new())),
            op::DICT => {
                let items = self.pop_to_mark("DICT")?;
                self.push(Object::Dict(pairs(items)));
            }
            op::LIST | op::FROZENSET => {
                let items = self.pop_to_mark("LIST")?;
                self.push(Object::List(items));
            }
            op::TUPLE => {
                let items = self.pop_to_mark("TUPLE")?;
                self.push(Object::Tuple(items));
            }
            op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                let n = (code - op::TUPLE1 + 1) as usize;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.pop("TUPLE")?);
                }
                items.reverse();
                self.push(Object::Tuple(items));
            }

            op::APPEND => {
                let item = self.pop("APPEND")?;
                self.extend_list(vec![item], "APPEND")?;
            }
            op::APPENDS | op::ADDITEMS => {
                let items = self.pop_to_mark("APPENDS")?;
                self.extend_list(items, "APPENDS")?;
            }
            op::SETITEM => {
                let value = self.pop("SETITEM")?;
                let key = self.pop("SETITEM")?;
                self.extend_dict(vec![(key, value)], "SETITEM")?;
            }
            op::SETITEMS => {
                let items = self.pop_to_mark("SETITEMS")?;
                self.extend_dict(pairs(items), "SETITEMS")?;
            }

            op::GLOBAL => {
                let module_name = read_line(r)?;
                let class_name = read_line(r)?;
                self.push(Object::Class {
                    module_name,
                    class_name,
                });
            }
            op::STACK_GLOBAL => {
                let class_name = self.pop_string("STACK_GLOBAL")?;
                let module_name = self.pop_string("STACK_GLOBAL")?;
                self.push(Object::Class {
                    module_name,
                    class_name,
                });
            }
            op::INST => {
                let module_name = read_line(r)?;
                let class_name = read_line(r)?;
                let args = self.pop_to_mark("INST")?;
                let class = Object::Class {
                    module_name,
                    class_name,
                };
                self.push(reduce(class, Object::Tuple(args)));
            }
            op::OBJ => {
                let mut items = self.pop_to_mark("OBJ")?.into_iter();
                let class = items.next().ok_or(PickleError::StackUnderflow("OBJ"))?;
                self.push(reduce(class, Object::Tuple(items.collect())));
            }
            op::REDUCE | op::NEWOBJ => {
                let args = self.pop("REDUCE")?;
                let callable = self.pop("REDUCE")?;
                self.push(reduce(callable, args));
            }
            op::NEWOBJ_EX => {
                let _kwargs = self.pop("NEWOBJ_EX")?;
                let args = self.pop("NEWOBJ_EX")?;
                let class = self.pop("NEWOBJ_EX")?;
                self.push(reduce(class, args));
            }
            op::BUILD => {
                let state = self.pop("BUILD")?;
                match self.stack.pop() {
                    Some(Entry::Value { obj, memo }) => self.stack.push(Entry::Value {
                        obj: build(obj, state),
                        memo,
                    }),
                    Some(Entry::Mark) => return Err(PickleError::MissingMark("BUILD")),
                    None => return Err(PickleError::StackUnderflow("BUILD")),
                }
            }

            op::PERSID => {
                let pid = read_line(r)?;
                self.push(Object::PersistentLoad(Box::new(Object::Unicode(pid))));
            }
            op::BINPERSID => {
                let pid = self.pop("BINPERSID")?;
                self.push(Object::PersistentLoad(Box::new(pid)));
            }

            op::PUT => {
                let key = read_line(r)?.parse().map_err(|_| PickleError::Malformed("PUT"))?;
                self.memoize(key, "PUT")?;
            }
            op::BINPUT => {
                let key = read_u8(r)? as u32;
                self.memoize(key, "BINPUT")?;
            }
            op::LONG_BINPUT => {
                let key = u32::from_le_bytes(read_array(r)?);
                self.memoize(key, "LONG_BINPUT")?;
            }
            op::MEMOIZE => {
                let key = self.memo.len() as u32;
                self.memoize(key, "MEMOIZE")?;
            }
            op::GET => {
                let key = read_line(r)?.parse().map_err(|_| PickleError::Malformed("GET"))?;
                self.recall(key)?;
            }
            op::BINGET => {
                let key = read_u8(r)? as u32;
                self.recall(key)?;
            }
            op::LONG_BINGET => {
                let key = u32::from_le_bytes(read_array(r)?);
                self.recall(key)?;
            }

            op::EXT1 | op::EXT2 | op::EXT4 => return Err(PickleError::Unsupported("EXT")),
            op::NEXT_BUFFER | op::READONLY_BUFFER => {
                return Err(PickleError::Unsupported("out-of-band buffer"))
            }
            other => return Err(PickleError::UnknownOpcode(other)),
        }
        Ok(())
    }

    fn push(&mut self, obj: Object) {
        self.stack.push(Entry::Value { obj, memo: None });
    }

    /// Remove the top slot, refreshing its memo entry with the finished value.
    fn pop_entry(&mut self, at: &'static str) -> Result<Entry> {
        let entry = self.stack.pop().ok_or(PickleError::StackUnderflow(at))?;
        if let Entry::Value { obj, memo: Some(key) } = &entry {
            self.memo.insert(*key, obj.clone());
        }
        Ok(entry)
    }

    fn pop(&mut self, at: &'static str) -> Result<Object> {
        match self.pop_entry(at)? {
            Entry::Value { obj, .. } => Ok(obj),
            Entry::Mark => Err(PickleError::Type {
                op: at,
                expected: "a value",
                found: "mark".into(),
            }),
        }
    }

    fn pop_string(&mut self, at: &'static str) -> Result<String> {
        match self.pop(at)? {
            Object::Unicode(s) => Ok(s),
            other => Err(PickleError::Type {
                op: at,
                expected: "str",
                found: other.type_name().into(),
            }),
        }
    }

    fn pop_to_mark(&mut self, at: &'static str) -> Result<Vec<Object>> {
        let mark = self
            .stack
            .iter()
            .rposition(|e| matches!(e, Entry::Mark))
            .ok_or(PickleError::MissingMark(at))?;
        let entries: Vec<Entry> = self.stack.drain(mark..).skip(1).collect();

        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Entry::Value { obj, memo } => {
                    if let Some(key) = memo {
                        self.memo.insert(key, obj.clone());
                    }
                    items.push(obj);
                }
                Entry::Mark => return Err(PickleError::Malformed(at)),
            }
        }
        Ok(items)
    }

    fn top_mut(&mut self, at: &'static str) -> Result<&mut Object> {
        match self.stack.last_mut() {
            Some(Entry::Value { obj, .. }) => Ok(obj),
            Some(Entry::Mark) => Err(PickleError::MissingMark(at)),
            None => Err(PickleError::StackUnderflow(at)),
        }
    }

    fn extend_list(&mut self, items: Vec<Object>, at: &'static str) -> Result<()> {
        match self.top_mut(at)? {
            Object::List(list) => list.extend(items),
            // contents of opaque list-like objects are not kept
            Object::Reduce { .. } | Object::Build { .. } => {}
            other => {
                return Err(PickleError::Type {
                    op: at,
                    expected: "list",
                    found: other.type_name().into(),
                })
            }
        }
        Ok(())
    }

    fn extend_dict(&mut self, items: Vec<(Object, Object)>, at: &'static str) -> Result<()> {
        match self.top_mut(at)? {
            Object::Dict(dict) => dict.extend(items),
            Object::Reduce { .. } | Object::Build { .. } => {}
            other => {
                return Err(PickleError::Type {
                    op: at,
                    expected: "dict",
                    found: other.type_name().into(),
                })
            }
        }
        Ok(())
    }

    fn memoize(&mut self, key: u32, at: &'static str) -> Result<()> {
        match self.stack.last_mut() {
            Some(Entry::Value { obj, memo }) => {
                *memo = Some(key);
                self.memo.insert(key, obj.clone());
                Ok(())
            }
            Some(Entry::Mark) => Err(PickleError::MissingMark(at)),
            None => Err(PickleError::StackUnderflow(at)),
        }
    }

    /// Push a memoized value. A value still on the stack is copied in its
    /// current state, later ones from the memo.
    fn recall(&mut self, key: u32) -> Result<()> {
        let live = self.stack.iter().rev().find_map(|e| match e {
            Entry::Value { obj, memo: Some(k) } if *k == key => Some(obj),
            _ => None,
        });
        let obj = match live {
            Some(obj) => obj.clone(),
            None => self.memo.get(&key).cloned().ok_or(PickleError::MissingMemo(key))?,
        };
        self.push(obj);
        Ok(())
    }
}

/// Calls to mapping constructors become empty mappings the stream then fills.
fn reduce(callable: Object, args: Object) -> Object {
    if let Object::Class {
        module_name,
        class_name,
    } = &callable
    {
        if module_name == "collections" && (class_name == "OrderedDict" || class_name == "defaultdict") {
            let items = match args {
                Object::Tuple(mut args) if class_name == "OrderedDict" && !args.is_empty() => match args.swap_remove(0) {
                    Object::List(items) => items
                        .into_iter()
                        .filter_map(|item| match item {
                            Object::Tuple(mut kv) if kv.len() == 2 => {
                                let value = kv.pop()?;
                                let key = kv.pop()?;
                                Some((key, value))
                            }
                            _ => None,
                        })
                        .collect(),
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            };
            return Object::Dict(items);
        }
    }
    Object::Reduce {
        callable: Box::new(callable),
        args: Box::new(args),
    }
}

fn build(target: Object, state: Object) -> Object {
    match target {
        // Instance attributes of a dict subclass, such as the `_metadata`
        // torch attaches to every state dict, are not mapping items
        Object::Dict(_) => {
            tracing::debug!(state = state.type_name(), "Dropping instance state of a mapping");
            target
        }
        target => Object::Build {
            callable: Box::new(target),
            args: Box::new(state),
        },
    }
}

fn pairs(items: Vec<Object>) -> Vec<(Object, Object)> {
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        out.push((key, value));
    }
    out
}

/// Little-endian two's complement, as written by LONG1 and LONG4.
fn decode_long(bytes: &[u8]) -> Object {
    if bytes.len() > 8 {
        return Object::BigInt;
    }
    let negative = bytes.last().is_some_and(|b| b & 0x80 != 0);
    let mut buf = if negative { [0xff; 8] } else { [0; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Object::Int(i64::from_le_bytes(buf))
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8> {
    let [b] = read_array::<1, _>(r)?;
    Ok(b)
}

fn read_array<const N: usize, R: Read>(r: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_len8<R: Read>(r: &mut R, at: &'static str) -> Result<usize> {
    usize::try_from(u64::from_le_bytes(read_array(r)?)).map_err(|_| PickleError::Malformed(at))
}

/// Read exactly `len` bytes without trusting `len` for the allocation.
fn read_bytes<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(PickleError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(buf)
}

fn read_utf8<R: Read>(r: &mut R, len: usize, at: &'static str) -> Result<Object> {
    let bytes = read_bytes(r, len)?;
    String::from_utf8(bytes)
        .map(Object::Unicode)
        .map_err(|_| PickleError::Malformed(at))
}

fn read_line<R: BufRead>(r: &mut R) -> Result<String> {
    let mut buf = Vec::new();
    r.read_until(b'\n', &mut buf)?;
    if buf.pop() != Some(b'\n') {
        return Err(PickleError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
