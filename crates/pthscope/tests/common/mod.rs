//! Fixture builders shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Items per MARK .. SETITEMS batch, as in CPython's pickler.
const BATCH_SIZE: usize = 1000;

/// Protocol-2 pickle writer emitting the opcodes `torch.save` produces,
/// memo puts and gets included.
pub struct Pickle {
    bytes: Vec<u8>,
    next_memo: u32,
    strings: HashMap<String, u32>,
    globals: HashMap<(String, String), u32>,
    storages: usize,
}

impl Pickle {
    pub fn new() -> Self {
        Pickle {
            bytes: vec![0x80, 0x02],
            next_memo: 0,
            strings: HashMap::new(),
            globals: HashMap::new(),
            storages: 0,
        }
    }

    pub fn op(&mut self, op: u8) -> &mut Self {
        self.bytes.push(op);
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Memoize the top of the stack.
    pub fn put(&mut self) -> &mut Self {
        let id = self.next_memo;
        self.next_memo += 1;
        match u8::try_from(id) {
            Ok(id) => self.raw(&[b'q', id]),
            Err(_) => self.op(b'r').raw(&id.to_le_bytes()),
        }
    }

    pub fn get(&mut self, id: u32) -> &mut Self {
        match u8::try_from(id) {
            Ok(id) => self.raw(&[b'h', id]),
            Err(_) => self.op(b'j').raw(&id.to_le_bytes()),
        }
    }

    /// Memo id of the most recent put.
    pub fn last_memo(&self) -> u32 {
        self.next_memo - 1
    }

    pub fn str(&mut self, s: &str) -> &mut Self {
        if let Some(&id) = self.strings.get(s) {
            return self.get(id);
        }
        self.op(b'X').raw(&(s.len() as u32).to_le_bytes()).raw(s.as_bytes()).put();
        self.strings.insert(s.to_string(), self.last_memo());
        self
    }

    pub fn int(&mut self, v: i64) -> &mut Self {
        if let Ok(v) = u8::try_from(v) {
            return self.raw(&[b'K', v]);
        }
        if let Ok(v) = u16::try_from(v) {
            return self.op(b'M').raw(&v.to_le_bytes());
        }
        if let Ok(v) = i32::try_from(v) {
            return self.op(b'J').raw(&v.to_le_bytes());
        }
        // LONG1 with the shortest two's complement encoding
        let bytes = v.to_le_bytes();
        let mut n = bytes.len();
        while n > 1 {
            let sign = bytes[n - 2] & 0x80;
            match bytes[n - 1] {
                0x00 if sign == 0 => n -= 1,
                0xff if sign != 0 => n -= 1,
                _ => break,
            }
        }
        self.raw(&[0x8a, n as u8]).raw(&bytes[..n])
    }

    pub fn float(&mut self, v: f64) -> &mut Self {
        self.op(b'G').raw(&v.to_be_bytes())
    }

    pub fn global(&mut self, module: &str, name: &str) -> &mut Self {
        let key = (module.to_string(), name.to_string());
        if let Some(&id) = self.globals.get(&key) {
            return self.get(id);
        }
        self.op(b'c').raw(format!("{}\n{}\n", module, name).as_bytes()).put();
        self.globals.insert(key, self.last_memo());
        self
    }

    pub fn empty_dict(&mut self) -> &mut Self {
        self.op(b'}').put()
    }

    /// Empty `collections.OrderedDict`; fill it with [`Pickle::set_items`].
    pub fn ordered_dict(&mut self) -> &mut Self {
        self.global("collections", "OrderedDict").op(b')').op(b'R').put()
    }

    /// Write `count` key/value pairs into the mapping on top of the stack.
    pub fn set_items(&mut self, count: usize, mut item: impl FnMut(&mut Self, usize)) -> &mut Self {
        let mut start = 0;
        while start < count {
            let end = (start + BATCH_SIZE).min(count);
            if end - start > 1 {
                self.op(b'(');
                (start..end).for_each(|i| item(self, i));
                self.op(b'u');
            } else {
                item(self, start);
                self.op(b's');
            }
            start = end;
        }
        self
    }

    pub fn dict(&mut self, count: usize, item: impl FnMut(&mut Self, usize)) -> &mut Self {
        self.empty_dict().set_items(count, item)
    }

    pub fn int_tuple(&mut self, values: &[i64]) -> &mut Self {
        match values.len() {
            0 => return self.op(b')'),
            1..=3 => {
                values.iter().for_each(|&v| {
                    self.int(v);
                });
                self.op(0x85 + values.len() as u8 - 1);
            }
            _ => {
                self.op(b'(');
                values.iter().for_each(|&v| {
                    self.int(v);
                });
                self.op(b't');
            }
        }
        self.put()
    }

    /// `torch._utils._rebuild_tensor_v2` call for a contiguous float tensor.
    pub fn tensor(&mut self, dims: &[u64]) -> &mut Self {
        self.tensor_with_storage("FloatStorage", dims)
    }

    pub fn tensor_with_storage(&mut self, storage: &str, dims: &[u64]) -> &mut Self {
        let numel: u64 = dims.iter().product();
        let key = self.storages.to_string();
        self.storages += 1;

        self.global("torch._utils", "_rebuild_tensor_v2").op(b'(');
        self.op(b'(')
            .str("storage")
            .global("torch", storage)
            .str(&key)
            .str("cpu")
            .int(numel as i64)
            .op(b't')
            .put()
            .op(b'Q');
        self.int(0);

        let mut strides = vec![1u64; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * dims[i + 1];
        }
        let size: Vec<i64> = dims.iter().map(|&d| d as i64).collect();
        let stride: Vec<i64> = strides.iter().map(|&s| s as i64).collect();
        self.int_tuple(&size).int_tuple(&stride);

        self.op(0x89).ordered_dict().op(b't').put().op(b'R').put()
    }

    /// `nn.Parameter` wrapping a float tensor.
    pub fn parameter(&mut self, dims: &[u64]) -> &mut Self {
        self.global("torch._utils", "_rebuild_parameter");
        self.tensor(dims).op(0x88).ordered_dict().op(0x87).put().op(b'R').put()
    }

    /// `model.state_dict()`: an OrderedDict of tensors carrying the
    /// `_metadata` attribute torch attaches to it.
    pub fn state_dict(&mut self, entries: &[(&str, &[u64])]) -> &mut Self {
        self.ordered_dict().set_items(entries.len(), |p, i| {
            let (key, dims) = entries[i];
            p.str(key).tensor(dims);
        });
        self.empty_dict().str("_metadata").ordered_dict();
        self.str("").empty_dict().str("version").int(1).op(b's');
        self.op(b's').op(b's').op(b'b')
    }

    /// An `nn.Module` instance: NEWOBJ of its class, then BUILD with its `__dict__`.
    pub fn module(&mut self, m: &Module) -> &mut Self {
        self.global(&m.module, &m.class).op(b')').op(0x81).put();
        self.empty_dict().op(b'(');
        self.str("training").op(0x88);
        self.str("_parameters").ordered_dict().set_items(m.params.len(), |p, i| {
            let (name, dims) = &m.params[i];
            p.str(name);
            match dims {
                Some(dims) => p.parameter(dims),
                None => p.op(b'N'),
            };
        });
        self.str("_buffers").ordered_dict();
        self.str("_non_persistent_buffers_set");
        self.global("__builtin__", "set").op(b']').put().op(0x85).put().op(b'R').put();
        for hooks in [
            "_backward_hooks",
            "_forward_hooks",
            "_forward_pre_hooks",
            "_state_dict_hooks",
            "_load_state_dict_pre_hooks",
        ] {
            self.str(hooks).ordered_dict();
        }
        self.str("_modules").ordered_dict().set_items(m.children.len(), |p, i| {
            let (name, child) = &m.children[i];
            p.str(name).module(child);
        });
        for (name, value) in &m.attrs {
            self.str(name).int(*value);
        }
        self.op(b'u').op(b'b')
    }

    pub fn finish(&mut self) -> Vec<u8> {
        self.op(b'.');
        std::mem::take(&mut self.bytes)
    }
}

/// Description of an `nn.Module` to pickle.
pub struct Module {
    module: String,
    class: String,
    params: Vec<(String, Option<Vec<u64>>)>,
    children: Vec<(String, Module)>,
    attrs: Vec<(String, i64)>,
}

impl Module {
    pub fn new(module: &str, class: &str) -> Self {
        Module {
            module: module.to_string(),
            class: class.to_string(),
            params: Vec::new(),
            children: Vec::new(),
            attrs: Vec::new(),
        }
    }

    pub fn linear(inp: u64, out: u64) -> Self {
        Module::new("torch.nn.modules.linear", "Linear")
            .param("weight", &[out, inp])
            .param("bias", &[out])
            .attr("in_features", inp as i64)
            .attr("out_features", out as i64)
    }

    pub fn param(mut self, name: &str, dims: &[u64]) -> Self {
        self.params.push((name.to_string(), Some(dims.to_vec())));
        self
    }

    /// A parameter slot holding `None`, like `bias=False`.
    pub fn no_param(mut self, name: &str) -> Self {
        self.params.push((name.to_string(), None));
        self
    }

    pub fn child(mut self, name: &str, child: Module) -> Self {
        self.children.push((name.to_string(), child));
        self
    }

    pub fn attr(mut self, name: &str, value: i64) -> Self {
        self.attrs.push((name.to_string(), value));
        self
    }
}

/// Write a `torch.save` style archive: `<name>/data.pkl` plus a version record.
pub fn write_archive(path: &Path, pickle: &[u8]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    zip.start_file("archive/data.pkl", options).unwrap();
    zip.write_all(pickle).unwrap();
    zip.start_file("archive/version", options).unwrap();
    zip.write_all(b"3\n").unwrap();
    zip.finish().unwrap();
}

pub fn write_safetensors(path: &Path, header: &str) {
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(header.as_bytes());
    std::fs::write(path, bytes).unwrap();
}
