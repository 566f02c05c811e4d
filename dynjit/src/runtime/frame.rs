//! Interpreter frames and the global namespace they execute against.

use super::{
    code::CodeObject,
    object::{BorrowedObj, ObjRef},
};
use std::{cell::RefCell, collections::HashMap, fmt, rc::Rc};

/// A module's global namespace, with a fallback set of builtins.
#[derive(Default)]
pub struct Globals {
    map: RefCell<HashMap<String, ObjRef>>,
    builtins: RefCell<HashMap<String, ObjRef>>,
}

impl Globals {
    pub fn new() -> Rc<Self> {
        let g = Rc::new(Globals::default());
        for (name, obj) in super::ops::builtins() {
            g.builtins.borrow_mut().insert(name.to_owned(), obj);
        }
        g
    }

    pub fn set(&self, name: &str, val: ObjRef) {
        self.map.borrow_mut().insert(name.to_owned(), val);
    }

    /// Look `name` up in the globals and then the builtins, returning a new reference.
    pub fn get(&self, name: &str) -> Option<ObjRef> {
        if let Some(x) = self.map.borrow().get(name) {
            return Some(x.clone());
        }
        self.builtins.borrow().get(name).cloned()
    }

    /// Remove every global, releasing the references to them.
    pub fn clear(&self) {
        self.map.borrow_mut().clear();
    }
}

/// One entry in a frame's block stack.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct BlockStackEntry {
    /// The opcode which pushed this block.
    pub opcode: u8,
    /// The offset of the handler to jump to when an exception unwinds to this block.
    pub handler_off: usize,
    /// The operand stack depth when the block was pushed.
    pub level: usize,
}

pub struct Frame {
    pub code: Rc<CodeObject>,
    pub globals: Rc<Globals>,
    /// Local variables: `None` means unbound.
    pub localsplus: Vec<Option<ObjRef>>,
    /// The operand stack. `None` entries are the null slot of the load-method convention.
    pub stack: Vec<Option<ObjRef>>,
    pub block_stack: Vec<BlockStackEntry>,
    /// The offset of the next instruction to execute.
    pub next_instr_offset: usize,
}

impl Frame {
    /// Create a frame with every local unbound and an empty stack.
    pub fn new(code: Rc<CodeObject>, globals: Rc<Globals>) -> Self {
        let n = code.nlocalsplus();
        Frame {
            code,
            globals,
            localsplus: (0..n).map(|_| None).collect(),
            stack: Vec::new(),
            block_stack: Vec::new(),
            next_instr_offset: 0,
        }
    }

    /// Create a frame for a call with arguments `args`.
    pub fn for_call(code: Rc<CodeObject>, globals: Rc<Globals>, args: &[BorrowedObj<'_>]) -> Self {
        let mut f = Frame::new(code, globals);
        for (slot, arg) in f.localsplus.iter_mut().zip(args) {
            *slot = Some(ObjRef::create(*arg));
        }
        f
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("code", &self.code.fullname())
            .field("localsplus", &self.localsplus)
            .field("stack", &self.stack)
            .field("block_stack", &self.block_stack)
            .field("next_instr_offset", &self.next_instr_offset)
            .finish()
    }
}
