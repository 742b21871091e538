//! End-to-end tests: host types bound into a live runtime and driven from scripts

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use void_lua::prelude::*;
use void_lua::{BindingState, RawHandle};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn demo_script() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/scripts/demo.lua")
}

fn demo_bridge() -> LuaBridge {
    init_logging();
    LuaBridge::from_files([demo_script()]).unwrap()
}

// ---------------------------------------------------------------------------
// Bound types
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Record {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    id: u32,
}

impl Record {
    fn sum(&self) -> f64 {
        self.a + self.b + self.c + self.d
    }
}

bind_type! {
    Record {
        fields { a: f64, b: f64, c: f64, d: f64 }
        readonly { id: u32 }
        methods {
            fn sum(&self) -> f64;
        }
    }
}

fn record() -> Record {
    Record {
        a: 1.0,
        b: 2.0,
        c: 3.0,
        d: 4.0,
        id: 7,
    }
}

struct Calculator;

impl Calculator {
    fn take_action(&self, action: String, a: f64, b: f64) -> f64 {
        match action.as_str() {
            "add" => a + b,
            "sub" => a - b,
            "mul" => a * b,
            "div" => a / b,
            _ => {
                log::warn!("Unknown action '{}'", action);
                0.0
            }
        }
    }

    fn checked_div(&self, a: f64, b: f64) -> std::result::Result<f64, String> {
        if b == 0.0 {
            Err("division by zero".to_string())
        } else {
            Ok(a / b)
        }
    }
}

bind_type! {
    Calculator {
        methods {
            fn take_action(&self, action: String, a: f64, b: f64) -> f64;
            fn checked_div(&self, a: f64, b: f64) -> Result<f64, String>;
        }
    }
}

struct TextBuffer {
    text: String,
}

impl TextBuffer {
    fn overwrite_append(&mut self, other: &TextBuffer, tail: String) {
        self.text = format!("{}{}", other.text, tail);
    }
}

bind_type! {
    TextBuffer {
        fields { text: String }
        methods {
            fn overwrite_append(&mut self, other: &TextBuffer, tail: String);
        }
    }
}

struct Mixed {
    x_: i32,
    y_: String,
}

bind_type! {
    Mixed {
        fields { x_: i32, y_: String }
    }
}

struct Swapped {
    u_: String,
    v_: i32,
}

bind_type! {
    Swapped {
        fields { u_: String, v_: i32 }
    }
}

struct Gauge {
    level: f64,
}

impl Gauge {
    fn level(&self) -> f64 {
        self.level * 100.0
    }
}

bind_type! {
    Gauge {
        fields { level: f64 }
        methods {
            fn level(&self) -> f64;
        }
    }
}

struct Fragile;

impl Fragile {
    fn explode(&self) -> f64 {
        panic!("kaboom")
    }
}

bind_type! {
    Fragile {
        methods {
            fn explode(&self) -> f64;
        }
    }
}

enum Role {
    Student { school: String },
    Driver { licence: String },
}

struct Person {
    name: String,
    role: Role,
}

impl Person {
    fn introduce(&self) -> String {
        match &self.role {
            Role::Student { school } => format!("{} studies at {}", self.name, school),
            Role::Driver { licence } => format!("{} drives with licence {}", self.name, licence),
        }
    }

    fn is_driver(&self) -> bool {
        matches!(self.role, Role::Driver { .. })
    }
}

bind_type! {
    Person {
        readonly { name: String }
        methods {
            fn introduce(&self) -> String;
            fn is_driver(&self) -> bool;
        }
    }
}

mod shadow {
    pub struct Record;

    void_lua::bind_type! {
        Record {}
    }
}

struct Unbound;

bind_type! {
    Unbound {}
}

/// Declares a field whose name cannot become a C string until fixed
struct Switchable {
    value: f64,
}

static SWITCHABLE_BROKEN: AtomicBool = AtomicBool::new(true);

struct BrokenName;
struct FixedName;

impl void_lua::Field<Switchable> for BrokenName {
    const NAME: &'static str = "val\0ue";
    type Value = f64;

    fn get(this: &Switchable) -> f64 {
        this.value
    }

    fn set(this: &mut Switchable, value: f64) {
        this.value = value;
    }
}

impl void_lua::Field<Switchable> for FixedName {
    const NAME: &'static str = "value";
    type Value = f64;

    fn get(this: &Switchable) -> f64 {
        this.value
    }

    fn set(this: &mut Switchable, value: f64) {
        this.value = value;
    }
}

impl Bindable for Switchable {
    fn describe(members: &mut Members<Self>) {
        if SWITCHABLE_BROKEN.load(Ordering::SeqCst) {
            members.field::<BrokenName>();
        } else {
            members.field::<FixedName>();
        }
    }
}

struct Sealed;

bind_type! {
    Sealed {}
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[test]
fn test_register_is_idempotent() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.register::<Record>().unwrap();
    let getters: Vec<String> = lua
        .registry()
        .binding::<Record>()
        .unwrap()
        .getter_names()
        .map(str::to_string)
        .collect();

    lua.register::<Record>().unwrap();
    let binding = lua.registry().binding::<Record>().unwrap();
    let again: Vec<String> = binding.getter_names().map(str::to_string).collect();
    assert_eq!(getters, again);
    assert_eq!(binding.prototype_name(), "RecordPtrPrototype");
    assert_eq!(binding.metatable_name(), "RecordPtrMetatable");
    assert_eq!(lua.registry().len(), 1);
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_registries_are_per_runtime() {
    init_logging();
    let mut first = LuaBridge::new().unwrap();
    let second = LuaBridge::new().unwrap();
    first.register::<Record>().unwrap();
    assert!(first.is_registered::<Record>());
    assert!(!second.is_registered::<Record>());
}

#[test]
fn test_name_collision_between_types() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.register::<Record>().unwrap();
    let err = lua.register::<shadow::Record>().unwrap_err();
    assert!(matches!(err, BindError::MetatableCollision { .. }));
    assert!(!lua.is_registered::<shadow::Record>());
}

#[test]
fn test_squatted_metatable_blocks_registration_until_cleared() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.exec(r#"debug.getregistry()["GaugePtrMetatable"] = {}"#).unwrap();

    let err = lua.register::<Gauge>().unwrap_err();
    assert!(matches!(err, BindError::MetatableCollision { .. }));
    assert!(!lua.is_registered::<Gauge>());
    assert_eq!(lua.top(), 0);

    lua.exec(r#"debug.getregistry()["GaugePtrMetatable"] = nil"#).unwrap();
    lua.register::<Gauge>().unwrap();
    assert!(lua.is_registered::<Gauge>());
}

#[test]
fn test_squatted_prototype_blocks_registration_until_cleared() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.exec(r#"debug.getregistry()["RecordPtrPrototype"] = {}"#).unwrap();

    let err = lua.register::<Record>().unwrap_err();
    assert!(matches!(err, BindError::MetatableCollision { .. }));
    assert!(!lua.is_registered::<Record>());
    lua.exec(r#"assert(debug.getregistry()["RecordPtrMetatable"] == nil)"#).unwrap();

    lua.exec(r#"debug.getregistry()["RecordPtrPrototype"] = nil"#).unwrap();
    lua.register::<Record>().unwrap();
    assert!(lua.is_registered::<Record>());
}

#[test]
fn test_invalid_member_name_rolls_back_and_retries() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();

    let err = lua.register::<Switchable>().unwrap_err();
    assert!(matches!(err, BindError::InteriorNul(_)));
    assert!(!lua.is_registered::<Switchable>());
    let binding = lua.registry().binding::<Switchable>().unwrap();
    assert_eq!(binding.state(), BindingState::Unregistered);
    assert_eq!(binding.getter_names().count(), 0);
    assert_eq!(binding.setter_names().count(), 0);
    assert_eq!(binding.method_names().count(), 0);
    lua.exec(
        r#"
        local reg = debug.getregistry()
        assert(rawget(reg, "SwitchablePtrPrototype") == nil)
        assert(rawget(reg, "SwitchablePtrMetatable") == nil)
        "#,
    )
    .unwrap();
    assert_eq!(lua.top(), 0);

    SWITCHABLE_BROKEN.store(false, Ordering::SeqCst);
    lua.register::<Switchable>().unwrap();
    let mut switchable = Switchable { value: 1.0 };
    lua.set_field(&mut switchable, "value", 9.0).unwrap();
    assert_eq!(switchable.value, 9.0);
}

#[test]
fn test_failed_construction_removes_partial_entries() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    // the prototype lands in the registry, the metatable write is refused
    lua.exec(
        r#"
        setmetatable(debug.getregistry(), {
            __newindex = function(t, k, v)
                if k == "SealedPtrMetatable" then error("registry is sealed") end
                rawset(t, k, v)
            end,
        })
        "#,
    )
    .unwrap();

    let err = lua.register::<Sealed>().unwrap_err();
    match &err {
        BindError::PrototypeConstruction { type_name, message } => {
            assert_eq!(type_name, "Sealed");
            assert!(message.contains("registry is sealed"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!lua.is_registered::<Sealed>());
    assert_eq!(lua.top(), 0);
    lua.exec(
        r#"
        local reg = debug.getregistry()
        assert(rawget(reg, "SealedPtrPrototype") == nil)
        assert(rawget(reg, "SealedPtrMetatable") == nil)
        setmetatable(reg, nil)
        "#,
    )
    .unwrap();

    lua.register::<Sealed>().unwrap();
    assert!(lua.is_registered::<Sealed>());
}

#[test]
fn test_pop_from_empty_stack_is_an_error() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    assert!(lua.pop::<f64>().is_err());
    assert!(lua.pop::<Option<f64>>().is_err());
    assert_eq!(lua.top(), 0);
    assert!(lua.stack().read::<Option<f64>>(-3).is_err());
    lua.stack().pop_n(2);
    assert_eq!(lua.top(), 0);

    lua.push(1.5).unwrap();
    assert_eq!(lua.pop::<f64>().unwrap(), 1.5);
    assert!(lua.pop::<f64>().is_err());
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_push_of_unregistered_type_fails() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    let mut unbound = Unbound;
    let handle = unsafe { Handle::from_mut(&mut unbound) };
    let err = lua.set_global("u", handle).unwrap_err();
    assert!(matches!(err, BindError::UnregisteredType(name) if name == "Unbound"));
    assert_eq!(lua.top(), 0);
}

// ---------------------------------------------------------------------------
// Fields
// ---------------------------------------------------------------------------

#[test]
fn test_script_reads_and_writes_record_fields() {
    let mut lua = demo_bridge();
    lua.register::<Record>().unwrap();

    let mut rec = record();
    lua.set_global("obj", unsafe { Handle::from_mut(&mut rec) }).unwrap();
    lua.exec(
        r#"
        assert(obj.a == 1.0)
        assert(obj.d == 4.0)
        assert(obj:sum() == 10.0)
        obj.a = 9
        "#,
    )
    .unwrap();
    lua.exec("obj = nil").unwrap();

    assert_eq!(rec.a, 9.0);
    assert_eq!(rec.b, 2.0);
}

#[test]
fn test_host_set_field_then_field() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.register::<Record>().unwrap();

    let mut rec = record();
    lua.set_field(&mut rec, "a", 9.0).unwrap();
    let a: f64 = lua.field(&mut rec, "a").unwrap();
    assert_eq!(a, 9.0);
    assert_eq!(rec.a, 9.0);
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_host_field_access_errors() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    let mut rec = record();

    let err = lua.field::<Record, f64>(&mut rec, "a").unwrap_err();
    assert!(matches!(err, BindError::UnregisteredType(_)));

    lua.register::<Record>().unwrap();
    let err = lua.field::<Record, f64>(&mut rec, "zzz").unwrap_err();
    assert!(matches!(err, BindError::UnknownField { .. }));

    // wrong value kind is reported by the setter, not stored
    let err = lua.set_field(&mut rec, "a", "nine").unwrap_err();
    assert!(matches!(err, BindError::Call { .. }));
    assert_eq!(rec.a, 1.0);
    assert!(lua.last_error().is_some());
}

#[test]
fn test_unknown_field_write_is_a_no_op() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.register::<Record>().unwrap();

    let mut rec = record();
    lua.set_global("obj", unsafe { Handle::from_mut(&mut rec) }).unwrap();
    lua.exec(
        r#"
        obj.zzz = 5
        assert(obj.zzz == nil)
        local proto = getmetatable(obj).__prototype
        assert(proto.__setters.zzz == nil)
        assert(proto.__getters.zzz == nil)
        assert(proto.__methods.zzz == nil)
        obj.id = 99
        assert(obj.id == 7)
        "#,
    )
    .unwrap();
    lua.exec("obj = nil").unwrap();

    // host-side writes to unknown names are ignored the same way
    lua.set_field(&mut rec, "zzz", 1.0).unwrap();
    assert_eq!(rec.sum(), 10.0);
    assert_eq!(rec.id, 7);
}

#[test]
fn test_unknown_field_write_errors_under_strict_policy() {
    init_logging();
    let config = BridgeConfig::default().with_unknown_fields(UnknownFieldPolicy::Error);
    let mut lua = LuaBridge::with_config(config).unwrap();
    lua.register::<Record>().unwrap();

    let mut rec = record();
    lua.set_global("obj", unsafe { Handle::from_mut(&mut rec) }).unwrap();
    let err = lua.exec("obj.zzz = 5").unwrap_err();
    assert!(matches!(err, BindError::Load { .. }));
    assert!(err.to_string().contains("cannot assign unknown field 'zzz'"));

    lua.exec("obj.a = 3").unwrap();
    lua.exec("obj = nil").unwrap();
    assert_eq!(rec.a, 3.0);

    let err = lua.set_field(&mut rec, "zzz", 1.0).unwrap_err();
    assert!(matches!(err, BindError::UnknownField { field, .. } if field == "zzz"));
}

#[test]
fn test_method_wins_over_getter() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.register::<Gauge>().unwrap();

    let mut gauge = Gauge { level: 0.5 };
    let handle = unsafe { Handle::from_mut(&mut gauge) };
    lua.exec("function read(g) assert(type(g.level) == 'function'); return g:level() end")
        .unwrap();
    let level: f64 = lua.call("read", (handle,)).unwrap();
    assert_eq!(level, 50.0);
}

#[test]
fn test_mixed_field_types() {
    let mut lua = demo_bridge();
    lua.register::<Mixed>().unwrap();
    lua.register::<Swapped>().unwrap();

    let mut a = Mixed {
        x_: 1,
        y_: "obj a".to_string(),
    };
    let mut b = Swapped {
        u_: "obj b".to_string(),
        v_: 4,
    };
    let ha = unsafe { Handle::from_mut(&mut a) };
    let hb = unsafe { Handle::from_mut(&mut b) };
    lua.call::<(), _>("consume_obj_a", (ha,)).unwrap();
    lua.call::<(), _>("consume_obj_b", (hb,)).unwrap();

    assert_eq!(a.x_, 42);
    assert_eq!(a.y_, "obj a seen by Lua");
    assert_eq!(b.u_, "rewritten");
    assert_eq!(b.v_, 40);
}

#[test]
fn test_fractional_write_to_integer_field_truncates() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.register::<Mixed>().unwrap();

    let mut a = Mixed {
        x_: 0,
        y_: String::new(),
    };
    lua.set_field(&mut a, "x_", 7.9).unwrap();
    assert_eq!(a.x_, 7);
    let err = lua.set_field(&mut a, "x_", 1.0e12).unwrap_err();
    assert!(err.to_string().contains("out of range"));
    assert_eq!(a.x_, 7);
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[test]
fn test_global_function_calls() {
    let mut lua = demo_bridge();

    lua.call::<(), _>("greet_person", ("Li Hua", 12, "student")).unwrap();
    let greeting: String = lua.global("greeting").unwrap();
    assert_eq!(greeting, "Hello, Li Hua! You are 12 and a student.");

    let sum: f64 = lua.call("a_plus_b", (1.0, 2.0)).unwrap();
    assert_eq!(sum, 3.0);

    let both: bool = lua.call_in_table("lib", "a_and_b", (true, false)).unwrap();
    assert!(!both);
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_pair_comes_back_in_declared_order() {
    let mut lua = demo_bridge();
    let (number, text): (f64, String) = lua.call("num_n_str", ()).unwrap();
    assert_eq!(number, 42.5);
    assert_eq!(text, "forty-two and a half");
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_results_can_be_discarded() {
    let mut lua = demo_bridge();
    let _: Ignored = lua.call("a_plus_b", (1, 2)).unwrap();
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_missing_function_reports_status() {
    let mut lua = demo_bridge();
    let err = lua.call::<(), _>("missing_function", ()).unwrap_err();
    assert_ne!(err.status(), 0);
    assert!(matches!(err, BindError::FunctionNotFound { .. }));
    assert!(err.to_string().contains("missing_function"));
    assert!(lua.last_error().unwrap().contains("missing_function"));
    assert!(err.diagnostic().unwrap().contains("missing_function"));
    assert_eq!(lua.top(), 0);

    // the runtime stays usable
    let sum: f64 = lua.call("a_plus_b", (2.0, 2.0)).unwrap();
    assert_eq!(sum, 4.0);
}

#[test]
fn test_missing_table_reports_status() {
    let mut lua = demo_bridge();
    let err = lua.call_in_table::<(), _>("nope", "f", ()).unwrap_err();
    assert!(matches!(err, BindError::TableNotFound { .. }));
    assert_ne!(err.status(), 0);
    assert!(err.diagnostic().unwrap().contains("'nope'"));

    let err = lua.call_in_table::<(), _>("lib", "missing", ()).unwrap_err();
    assert!(matches!(err, BindError::FunctionNotFound { .. }));
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_script_error_is_reported_not_raised() {
    let mut lua = demo_bridge();
    let err = lua.call::<(), _>("fail", ("broken on purpose",)).unwrap_err();
    match &err {
        BindError::Call { status, message, .. } => {
            assert_eq!(*status, CallStatus::Runtime);
            assert!(message.contains("broken on purpose"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.status(), 2);
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_traceback_is_appended_when_enabled() {
    init_logging();
    let config = BridgeConfig::default()
        .with_preload(demo_script())
        .with_traceback(true);
    let mut lua = LuaBridge::with_config(config).unwrap();
    let err = lua.call::<(), _>("fail", ("deep trouble",)).unwrap_err();
    let message = err.diagnostic().unwrap();
    assert!(message.contains("deep trouble"));
    assert!(message.contains("stack traceback"));
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_returned_string_is_a_copy() {
    let mut lua = demo_bridge();
    let text: String = lua.call("identity", ("kept after collection",)).unwrap();
    lua.exec("collectgarbage('collect')").unwrap();
    assert_eq!(text, "kept after collection");
}

#[test]
fn test_handle_round_trips_through_script() {
    let mut lua = demo_bridge();
    lua.register::<Record>().unwrap();

    let mut rec = record();
    let handle = unsafe { Handle::from_mut(&mut rec) };
    let back: Handle<Record> = lua.call("identity", (handle,)).unwrap();
    assert_eq!(back, handle);

    let value: Value = lua.call("identity", (handle,)).unwrap();
    let raw: &RawHandle = value.as_handle().unwrap();
    assert_eq!(raw.type_name, "Record");
    assert_eq!(raw.ptr, handle.as_ptr().cast::<std::ffi::c_void>());
}

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

#[test]
fn test_method_with_string_argument() {
    let mut lua = demo_bridge();
    lua.register::<Calculator>().unwrap();

    let mut calc = Calculator;
    let handle = unsafe { Handle::from_mut(&mut calc) };
    let (add, sub, div): (f64, f64, f64) = lua.call("take_action", (handle,)).unwrap();
    assert_eq!((add, sub, div), (9.0, 3.0, 2.0));
}

#[test]
fn test_method_with_reference_argument() {
    let mut lua = demo_bridge();
    lua.register::<TextBuffer>().unwrap();

    let mut x = TextBuffer {
        text: "x!".to_string(),
    };
    let mut y = TextBuffer {
        text: "y!".to_string(),
    };
    let hx = unsafe { Handle::from_mut(&mut x) };
    let hy = unsafe { Handle::from_mut(&mut y) };
    lua.call::<(), _>("overwrite_append", (hx, hy)).unwrap();

    assert_eq!(x.text, "y! appended");
    assert_eq!(y.text, "y!");
}

#[test]
fn test_aliased_reference_argument_is_rejected() {
    let mut lua = demo_bridge();
    lua.register::<TextBuffer>().unwrap();

    let mut x = TextBuffer {
        text: "x!".to_string(),
    };
    let hx = unsafe { Handle::from_mut(&mut x) };
    let err = lua.call::<(), _>("overwrite_append", (hx, hx)).unwrap_err();
    assert!(err.to_string().contains("aliases"));
    assert_eq!(x.text, "x!");
}

#[test]
fn test_handle_of_wrong_type_is_rejected() {
    let mut lua = demo_bridge();
    lua.register::<Record>().unwrap();
    lua.register::<Calculator>().unwrap();
    lua.exec(
        r#"
        function misuse(rec, calc)
            return calc.take_action(rec, "add", 1, 2)
        end
        "#,
    )
    .unwrap();

    let mut rec = record();
    let mut calc = Calculator;
    let hr = unsafe { Handle::from_mut(&mut rec) };
    let hc = unsafe { Handle::from_mut(&mut calc) };
    let err = lua.call::<f64, _>("misuse", (hr, hc)).unwrap_err();
    let message = err.diagnostic().unwrap();
    assert!(message.contains("Bad handle"));
    assert!(message.contains("Calculator"));
}

#[test]
fn test_wrong_argument_kind_is_a_script_error() {
    let mut lua = demo_bridge();
    lua.register::<Calculator>().unwrap();
    lua.exec(
        r#"
        function bad_args(calc)
            local ok, err = pcall(calc.take_action, calc, "add", {}, 1)
            assert(not ok)
            return err
        end
        "#,
    )
    .unwrap();

    let mut calc = Calculator;
    let handle = unsafe { Handle::from_mut(&mut calc) };
    let message: String = lua.call("bad_args", (handle,)).unwrap();
    assert!(message.contains("take_action"));
    assert!(message.contains("expected number"));
}

#[test]
fn test_host_error_becomes_script_error() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.register::<Calculator>().unwrap();
    lua.exec(
        r#"
        function safe_div(calc, a, b)
            local ok, value = pcall(calc.checked_div, calc, a, b)
            if ok then return value end
            return -1
        end
        "#,
    )
    .unwrap();

    let mut calc = Calculator;
    let handle = unsafe { Handle::from_mut(&mut calc) };
    let half: f64 = lua.call("safe_div", (handle, 1.0, 2.0)).unwrap();
    assert_eq!(half, 0.5);
    let failed: f64 = lua.call("safe_div", (handle, 1.0, 0.0)).unwrap();
    assert_eq!(failed, -1.0);
}

#[test]
fn test_panic_in_method_becomes_script_error() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.register::<Fragile>().unwrap();
    lua.exec(
        r#"
        function poke(f)
            local ok, err = pcall(f.explode, f)
            return ok, err
        end
        "#,
    )
    .unwrap();

    let mut fragile = Fragile;
    let handle = unsafe { Handle::from_mut(&mut fragile) };
    let (ok, err): (bool, String) = lua.call("poke", (handle,)).unwrap();
    assert!(!ok);
    assert!(err.contains("kaboom"));

    // uncaught on the script side, it reaches the host as a call error
    lua.exec("function poke_hard(f) return f:explode() end").unwrap();
    let err = lua.call::<f64, _>("poke_hard", (handle,)).unwrap_err();
    assert!(err.diagnostic().unwrap().contains("kaboom"));
    assert_eq!(lua.top(), 0);
}

#[test]
fn test_closed_variants_dispatch_per_object() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.register::<Person>().unwrap();
    lua.exec(
        r#"
        function introduce_all(a, b)
            local drivers = 0
            for _, p in ipairs({ a, b }) do
                if p:is_driver() then drivers = drivers + 1 end
            end
            return a:introduce() .. " / " .. b:introduce(), drivers
        end
        "#,
    )
    .unwrap();

    let mut student = Person {
        name: "Li Hua".to_string(),
        role: Role::Student {
            school: "No. 1 Middle School".to_string(),
        },
    };
    let mut driver = Person {
        name: "Wang Wei".to_string(),
        role: Role::Driver {
            licence: "C1".to_string(),
        },
    };
    let hs = unsafe { Handle::from_mut(&mut student) };
    let hd = unsafe { Handle::from_mut(&mut driver) };
    let (text, drivers): (String, i32) = lua.call("introduce_all", (hs, hd)).unwrap();
    assert_eq!(
        text,
        "Li Hua studies at No. 1 Middle School / Wang Wei drives with licence C1"
    );
    assert_eq!(drivers, 1);
}

// ---------------------------------------------------------------------------
// Map views
// ---------------------------------------------------------------------------

#[test]
fn test_map_view_exposes_at() {
    init_logging();
    let mut lua = LuaBridge::new().unwrap();
    lua.register::<HashMap<String, f64>>().unwrap();

    let mut prices: HashMap<String, f64> = HashMap::new();
    prices.insert("apple".to_string(), 1.5);
    prices.insert("pear".to_string(), 2.25);

    lua.set_global("prices", unsafe { Handle::from_mut(&mut prices) }).unwrap();
    lua.exec(
        r#"
        assert(prices:at("apple") == 1.5)
        assert(prices:at("pear") == 2.25)
        assert(prices.apple == nil)
        assert(prices.insert == nil)
        local ok, err = pcall(prices.at, prices, "durian")
        assert(not ok)
        assert(string.find(err, "not found", 1, true))
        prices = nil
        "#,
    )
    .unwrap();
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[test]
fn test_preload_from_temp_file() {
    init_logging();
    let mut file = tempfile::Builder::new().suffix(".lua").tempfile().unwrap();
    writeln!(file, "function triple(x) return x * 3 end").unwrap();

    let config = BridgeConfig::default().with_preload(file.path());
    let mut lua = LuaBridge::with_config(config).unwrap();
    let nine: f64 = lua.call("triple", (3.0,)).unwrap();
    assert_eq!(nine, 9.0);
}

#[test]
fn test_missing_preload_file_fails_construction() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let err = LuaBridge::from_files([dir.path().join("absent.lua")]).err().unwrap();
    assert!(matches!(err, BindError::Io(_)));
}

#[test]
fn test_syntax_error_in_preload_fails_construction() {
    init_logging();
    let mut file = tempfile::Builder::new().suffix(".lua").tempfile().unwrap();
    writeln!(file, "function broken(").unwrap();

    let err = LuaBridge::from_files([file.path()]).err().unwrap();
    match err {
        BindError::Load { status, .. } => assert_eq!(status, CallStatus::Syntax),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_exec_syntax_error_keeps_runtime_usable() {
    let mut lua = demo_bridge();
    let err = lua.exec("this is not lua").unwrap_err();
    assert_eq!(err.status(), CallStatus::Syntax.code());
    assert!(lua.last_error().is_some());
    let sum: f64 = lua.call("a_plus_b", (0.5, 0.25)).unwrap();
    assert_eq!(sum, 0.75);
    assert_eq!(lua.top(), 0);
}
