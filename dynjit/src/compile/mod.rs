//! The compilation driver: bytecode in, callable machine code out.

use crate::{
    codegen::{
        regalloc::allocate,
        x64::{assemble, Assembled},
    },
    deopt::{reify_frame, DeoptAction, DeoptMetadata, DeoptReason},
    hir::{builder::build, refcount::insert_refcount_ops},
    lir::lower::{lower, Lowered},
    log::{
        check_log_ir, log_ir_phase,
        stats::{Stats, TimingState},
        IRPhase, Log, Verbosity,
    },
    runtime::{
        exc::{set_pending, take_pending},
        interp::{eval_frame, unwind},
        BorrowedObj, CodeObject, Exception, ExceptionKind, Frame, Globals, ObjRef, Object, Ref,
    },
};
use std::{error::Error, fmt, mem, rc::Rc, slice};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompilationError {
    /// Something went wrong when compiling that is probably the result of a bytecode construct
    /// we don't yet support.
    #[error("General error: {0}")]
    General(String),
    /// Something went wrong when compiling that is probably the result of a bug in the JIT.
    #[error("Internal error: {0}")]
    InternalError(String),
    /// A fixed limit of the code generator (e.g. the number of call arguments) was exceeded.
    #[error("Internal error: {0}")]
    LimitExceeded(String),
    /// Compilation required more of a system resource (e.g. executable memory) than was
    /// available.
    #[error("Internal error: {0:}")]
    ResourceExhausted(Box<dyn Error>),
}

/// The number of general purpose registers saved by a deopt stub.
const NUM_SAVED_REGS: usize = 16;

/// State shared between the [Jit] and everything it compiles.
struct Shared {
    log: Log,
    stats: Stats,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.stats.output();
    }
}

pub struct Jit {
    shared: Rc<Shared>,
}

impl Jit {
    /// Create a JIT, reading its logging configuration from the environment.
    pub fn new() -> Result<Self, Box<dyn Error>> {
        check_log_ir()?;
        Ok(Jit {
            shared: Rc::new(Shared {
                log: Log::new()?,
                stats: Stats::new(),
            }),
        })
    }

    /// Compile `code` to run against `globals`.
    pub fn compile(
        &self,
        code: Rc<CodeObject>,
        globals: &Rc<Globals>,
    ) -> Result<CompiledFunction, CompilationError> {
        let stats = &self.shared.stats;
        stats.timing_state(TimingState::Compiling);
        let r = self.compile_inner(Rc::clone(&code), globals);
        stats.timing_state(TimingState::None);
        match &r {
            Ok(f) => {
                stats.function_compiled_ok();
                self.shared.log.log(
                    Verbosity::JITEvent,
                    &format!(
                        "compiled {} ({} bytes, {} deopts)",
                        code.fullname(),
                        f.code().len(),
                        f.deopts().len()
                    ),
                );
            }
            Err(e) => {
                stats.function_compiled_err();
                self.shared.log.log(
                    Verbosity::Warning,
                    &format!("failed to compile {}: {e}", code.fullname()),
                );
            }
        }
        r
    }

    fn compile_inner(
        &self,
        code: Rc<CodeObject>,
        globals: &Rc<Globals>,
    ) -> Result<CompiledFunction, CompilationError> {
        let mut hir = build(Rc::clone(&code), globals)?;
        log_ir_phase(IRPhase::HIR, || hir.to_string());
        insert_refcount_ops(&mut hir);
        log_ir_phase(IRPhase::HIRRefcount, || hir.to_string());

        let Lowered {
            func: mut lir,
            keep_alive,
        } = lower(&hir, globals);
        log_ir_phase(IRPhase::LIR, || lir.to_string());
        let alloc = allocate(&mut lir);
        log_ir_phase(IRPhase::LIRAlloc, || {
            format!("{alloc}\n{}", lir.display(Some(&alloc.locs)))
        });

        // The runtime is boxed so that its address, which is baked into the deopt sequence,
        // stays put when the `CompiledFunction` moves.
        let rt = Box::new(CodeRuntime {
            code,
            globals: Rc::clone(globals),
            deopts: mem::take(&mut lir.deopts),
            keep_alive,
            shared: Rc::clone(&self.shared),
        });
        let asm = assemble(
            &lir,
            &alloc,
            deopt_entry as usize,
            &*rt as *const CodeRuntime as usize,
        )?;
        log_ir_phase(IRPhase::Asm, || {
            asm.disassemble(true)
                .unwrap_or_else(|e| format!("<disassembly failed: {e}>"))
        });
        Ok(CompiledFunction { asm, rt })
    }
}

/// Everything compiled code needs at run time that isn't in the machine code itself.
struct CodeRuntime {
    code: Rc<CodeObject>,
    globals: Rc<Globals>,
    deopts: Vec<DeoptMetadata>,
    /// Objects whose addresses are embedded in the machine code.
    #[allow(dead_code)]
    keep_alive: Vec<ObjRef>,
    shared: Rc<Shared>,
}

/// The signature of compiled code: a pointer to an array of borrowed arguments in, a new
/// reference (or null with an exception pending) out.
type EntryFn = unsafe extern "C" fn(*const *mut Object) -> *mut Object;

pub struct CompiledFunction {
    asm: Assembled,
    rt: Box<CodeRuntime>,
}

impl CompiledFunction {
    pub fn call(&self, args: &[BorrowedObj<'_>]) -> Result<ObjRef, Exception> {
        let code = &self.rt.code;
        if args.len() != code.argcount {
            return Err(Exception::type_error(format!(
                "{}() takes {} positional arguments but {} were given",
                code.name,
                code.argcount,
                args.len()
            )));
        }
        let raw = args.iter().map(|a| a.as_ptr()).collect::<Vec<_>>();
        let shared = &self.rt.shared;
        shared.stats.function_executed();
        shared.log.log(
            Verbosity::Execution,
            &format!("enter compiled {}", code.fullname()),
        );
        shared.stats.timing_state(TimingState::JitExecuting);
        let r = unsafe {
            let f = mem::transmute::<*const u8, EntryFn>(self.asm.entry());
            f(raw.as_ptr())
        };
        shared.stats.timing_state(TimingState::None);
        match unsafe { Ref::steal_raw(r) } {
            Some(x) => Ok(x),
            None => Err(take_pending().unwrap_or_else(|| {
                Exception::new(
                    ExceptionKind::SystemError,
                    "compiled code returned null without an exception",
                )
            })),
        }
    }

    pub fn code(&self) -> &[u8] {
        self.asm.code()
    }

    pub fn entry(&self) -> *const u8 {
        self.asm.entry()
    }

    pub fn disassemble(&self) -> Result<String, Box<dyn Error>> {
        self.asm.disassemble(false)
    }

    pub fn deopts(&self) -> &[DeoptMetadata] {
        &self.rt.deopts
    }

    /// The metadata of the deopt point whose guard or stub contains the code address `addr`.
    pub fn deopt_at(&self, addr: usize) -> Option<&DeoptMetadata> {
        let off = addr.checked_sub(self.entry() as usize)?;
        self.asm
            .deopt_at_offset(off)
            .and_then(|i| self.rt.deopts.get(i))
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CompiledFunction({}, {} bytes)",
            self.rt.code.fullname(),
            self.code().len()
        )
    }
}

/// Called from a deopt stub: rebuild the interpreter frame for deopt point `idx` from the saved
/// registers `regs` and finish executing the function in the interpreter.
extern "C" fn deopt_entry(regs: *const u64, idx: u64, rt: *const CodeRuntime) -> *mut Object {
    let rt = unsafe { &*rt };
    let stats = &rt.shared.stats;
    stats.timing_state(TimingState::Deopting);
    stats.deopt();
    let Some(meta) = usize::try_from(idx).ok().and_then(|i| rt.deopts.get(i)) else {
        crate::jit_abort!("deopt index {idx} out of range in {}", rt.code.fullname())
    };
    rt.shared.log.log(
        Verbosity::JITEvent,
        &format!(
            "deopt {idx} in {}: {} at offset {}",
            rt.code.fullname(),
            meta.reason,
            meta.next_instr_offset
        ),
    );

    let mut frame = Frame::new(Rc::clone(&rt.code), Rc::clone(&rt.globals));
    unsafe {
        let regs = slice::from_raw_parts(regs, NUM_SAVED_REGS);
        reify_frame(&mut frame, meta, regs);
    }

    let r = match meta.action {
        DeoptAction::ResumeInInterpreter => Ok(()),
        DeoptAction::Unwind => {
            let exc = match meta.reason {
                DeoptReason::UnhandledUnboundLocal => usize::try_from(meta.eh_name_index)
                    .ok()
                    .and_then(|i| rt.code.varnames.get(i))
                    .map(|n| Exception::unbound_local(n))
                    .unwrap_or_else(|| {
                        Exception::new(ExceptionKind::SystemError, "bad unbound local index")
                    }),
                _ => take_pending().unwrap_or_else(|| {
                    Exception::new(
                        ExceptionKind::SystemError,
                        "deoptimised to unwind without a pending exception",
                    )
                }),
            };
            unwind(&mut frame, exc)
        }
    };
    stats.timing_state(TimingState::None);
    match r.and_then(|()| eval_frame(&mut frame)) {
        Ok(v) => v.release().as_ptr(),
        Err(e) => {
            set_pending(e);
            std::ptr::null_mut()
        }
    }
}
