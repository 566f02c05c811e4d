//! End-to-end tests: compile small functions, run them, and check that they behave exactly as
//! the interpreter does, including when compiled code has to deoptimise.

use dynjit::{
    runtime::{
        code::{CodeBuilder, Opcode},
        interp::call_function,
        object::live_objects,
        CodeObject, Exception, ExceptionKind, Globals, ObjRef, Object,
    },
    CompilationError, Jit,
};
use fm::FMBuilder;
use regex::Regex;
use std::{rc::Rc, sync::LazyLock};

static PTN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{.+?\}\}").unwrap());
static TEXT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[a-zA-Z0-9\._]+").unwrap());

fn show(r: &Result<ObjRef, Exception>) -> String {
    match r {
        Ok(x) => format!("{x:?}"),
        Err(e) => e.to_string(),
    }
}

/// Run `code` both interpreted and compiled, check the results agree, and return the compiled
/// result.
fn check_parity(code: &Rc<CodeObject>, globals: &Rc<Globals>, args: &[ObjRef]) -> String {
    let jit = Jit::new().unwrap();
    let f = jit.compile(Rc::clone(code), globals).unwrap();
    let args = args.iter().map(|x| x.borrow()).collect::<Vec<_>>();
    let interp = call_function(Rc::clone(code), Rc::clone(globals), &args);
    let jitted = f.call(&args);
    assert_eq!(show(&interp), show(&jitted), "{}", code.fullname());
    show(&jitted)
}

fn add_mul() -> Rc<CodeObject> {
    // def f(a, b): return (a + b) * b
    CodeBuilder::new("add_mul")
        .args(&["a", "b"])
        .op(Opcode::LoadFast, 0)
        .op(Opcode::LoadFast, 1)
        .op(Opcode::BinaryAdd, 0)
        .op(Opcode::LoadFast, 1)
        .op(Opcode::BinaryMultiply, 0)
        .op(Opcode::ReturnValue, 0)
        .build()
}

fn branch() -> Rc<CodeObject> {
    // def f(x):
    //   if x < 10: return 1
    //   return 2
    CodeBuilder::new("branch")
        .args(&["x"])
        .consts(vec![Object::int(10), Object::int(1), Object::int(2)])
        .op(Opcode::LoadFast, 0)
        .op(Opcode::LoadConst, 0)
        .op(Opcode::CompareOp, 0)
        .op(Opcode::PopJumpIfFalse, 12)
        .op(Opcode::LoadConst, 1)
        .op(Opcode::ReturnValue, 0)
        .op(Opcode::LoadConst, 2)
        .op(Opcode::ReturnValue, 0)
        .build()
}

fn loop_sum() -> Rc<CodeObject> {
    // def f(xs):
    //   t = 0
    //   for x in xs: t += x
    //   return t
    CodeBuilder::new("loop_sum")
        .args(&["xs"])
        .locals(&["t", "x"])
        .consts(vec![Object::int(0)])
        .op(Opcode::LoadConst, 0)
        .op(Opcode::StoreFast, 1)
        .op(Opcode::LoadFast, 0)
        .op(Opcode::GetIter, 0)
        .op(Opcode::ForIter, 12)
        .op(Opcode::StoreFast, 2)
        .op(Opcode::LoadFast, 1)
        .op(Opcode::LoadFast, 2)
        .op(Opcode::InplaceAdd, 0)
        .op(Opcode::StoreFast, 1)
        .op(Opcode::JumpAbsolute, 8)
        .op(Opcode::LoadFast, 1)
        .op(Opcode::ReturnValue, 0)
        .build()
}

fn add_global() -> Rc<CodeObject> {
    // def f(x): return k + x
    CodeBuilder::new("add_global")
        .args(&["x"])
        .names(&["k"])
        .op(Opcode::LoadGlobal, 0)
        .op(Opcode::LoadFast, 0)
        .op(Opcode::BinaryAdd, 0)
        .op(Opcode::ReturnValue, 0)
        .build()
}

#[test]
fn arithmetic_matches_interpreter() {
    let before = live_objects();
    {
        let g = Globals::new();
        let code = add_mul();
        assert_eq!(check_parity(&code, &g, &[Object::int(2), Object::int(3)]), "15");
        assert_eq!(check_parity(&code, &g, &[Object::int(-4), Object::int(0)]), "0");
        // Adding a str to an int raises in a helper, which deoptimises to unwind.
        let r = check_parity(&code, &g, &[Object::str("a"), Object::int(1)]);
        assert!(r.starts_with("TypeError"), "{r}");
    }
    assert_eq!(live_objects(), before);
}

#[test]
fn branches_match_interpreter() {
    let before = live_objects();
    {
        let g = Globals::new();
        let code = branch();
        assert_eq!(check_parity(&code, &g, &[Object::int(3)]), "1");
        assert_eq!(check_parity(&code, &g, &[Object::int(10)]), "2");
    }
    assert_eq!(live_objects(), before);
}

#[test]
fn loops_match_interpreter() {
    let before = live_objects();
    {
        let g = Globals::new();
        let code = loop_sum();
        let xs = Object::list(vec![Object::int(1), Object::int(2), Object::int(3)]);
        assert_eq!(check_parity(&code, &g, &[xs]), "6");
        let empty = Object::tuple(vec![]);
        assert_eq!(check_parity(&code, &g, &[empty]), "0");
    }
    assert_eq!(live_objects(), before);
}

#[test]
fn changed_global_deoptimises() {
    let before = live_objects();
    {
        let g = Globals::new();
        g.set("k", Object::int(1));
        let jit = Jit::new().unwrap();
        let f = jit.compile(add_global(), &g).unwrap();
        assert!(!f.deopts().is_empty());

        let x = Object::int(5);
        assert_eq!(f.call(&[x.borrow()]).unwrap().as_int(), Some(6));
        // The guard on `k`'s value now fails and the rest of the function runs in the
        // interpreter.
        g.set("k", Object::int(10));
        assert_eq!(f.call(&[x.borrow()]).unwrap().as_int(), Some(15));
        g.set("k", Object::str("s"));
        let e = f.call(&[x.borrow()]).unwrap_err();
        assert_eq!(e.kind, ExceptionKind::TypeError);
        g.clear();
    }
    assert_eq!(live_objects(), before);
}

#[test]
fn unbound_local_is_raised() {
    let code = CodeBuilder::new("f")
        .locals(&["x"])
        .op(Opcode::LoadFast, 0)
        .op(Opcode::ReturnValue, 0)
        .build();
    let jit = Jit::new().unwrap();
    let f = jit.compile(code, &Globals::new()).unwrap();
    let e = f.call(&[]).unwrap_err();
    assert_eq!(e.kind, ExceptionKind::UnboundLocalError);
    assert_eq!(
        e.to_string(),
        "UnboundLocalError: local variable 'x' referenced before assignment"
    );
}

#[test]
fn deopt_unwinds_to_handler() {
    let before = live_objects();
    {
        // try: return x
        // except: return 7
        let code = CodeBuilder::new("g")
            .locals(&["x"])
            .consts(vec![Object::int(7)])
            .op(Opcode::SetupFinally, 4)
            .op(Opcode::LoadFast, 0)
            .op(Opcode::ReturnValue, 0)
            .op(Opcode::PopTop, 0)
            .op(Opcode::LoadConst, 0)
            .op(Opcode::ReturnValue, 0)
            .build();
        assert_eq!(check_parity(&code, &Globals::new(), &[]), "7");
    }
    assert_eq!(live_objects(), before);
}

#[test]
fn wrong_number_of_arguments() {
    let jit = Jit::new().unwrap();
    let f = jit.compile(add_mul(), &Globals::new()).unwrap();
    let x = Object::int(1);
    let e = f.call(&[x.borrow()]).unwrap_err();
    assert_eq!(e.kind, ExceptionKind::TypeError);
    assert_eq!(
        e.to_string(),
        "TypeError: add_mul() takes 2 positional arguments but 1 were given"
    );
}

#[test]
fn empty_code_is_not_compiled() {
    let jit = Jit::new().unwrap();
    match jit.compile(CodeBuilder::new("f").build(), &Globals::new()) {
        Err(CompilationError::General(m)) => assert_eq!(m, "empty code object"),
        r => panic!("{r:?}"),
    }
}

#[test]
fn compilation_is_deterministic() {
    // Embedded addresses differ between compilations, so mask every wide immediate.
    let addr = Regex::new(r"0x[0-9a-f]{6,}").unwrap();
    let g = Globals::new();
    let jit = Jit::new().unwrap();
    let dis = |code: Rc<CodeObject>| {
        let f = jit.compile(code, &g).unwrap();
        let d = f.disassemble().unwrap();
        (f.code().len(), addr.replace_all(&d, "<addr>").into_owned())
    };
    let code = loop_sum();
    assert_eq!(dis(Rc::clone(&code)), dis(code));
}

#[test]
fn disassembly_is_annotated() {
    let jit = Jit::new().unwrap();
    let g = Globals::new();
    g.set("k", Object::int(1));
    let f = jit.compile(add_global(), &g).unwrap();
    let dis = f.disassemble().unwrap();
    let ptn = "
        ; prologue for jittestmodule:add_global
        push rbp
        mov rbp, rsp
        ...
        ; bb %0
        ...
        ; guard is -> deopt {{guard}}
        ...
        ; epilogue
        ...
        ret
        ...
        ; deopt stub {{stub}}
        ...
        ; save registers and deoptimise
        ...
        call rax
        ...";
    let m = FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
        .build()
        .unwrap();
    if let Err(e) = m.matches(&dis.to_lowercase()) {
        panic!("{e}");
    }
    assert!(f.deopt_at(f.entry() as usize).is_none());
    assert!(f.deopt_at(0).is_none());
}
