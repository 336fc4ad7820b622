//! Shared test helpers for integration tests
#![allow(dead_code)]

use code_revive::config::Config;
use code_revive::records::{DepType, OptRecord};
use code_revive::vm::{
    ClassSpec, CodeAssembler, CompiledMethod, InMemoryVm, KlassHandle, KnownObject, LoaderType, MetaRef,
    MethodHandle, ObjectRef, VmGlobalKind,
};
use code_revive::{CodeRevive, SaveReport};
use std::path::Path;

/// A small application: a shape hierarchy and a driver method
pub struct App {
    pub vm: InMemoryVm,
    pub main: KlassHandle,
    pub shape: KlassHandle,
    pub circle: KlassHandle,
    pub square: KlassHandle,
    pub run: MethodHandle,
    pub area: MethodHandle,
}

/// Define the application; `shift` displaces every runtime address and
/// `reversed` defines the classes in the opposite order, so handles differ
/// between two processes
pub fn app_with(shift: u64, reversed: bool) -> App {
    let mut vm = InMemoryVm::with_address_shift(shift);
    let mut define = |vm: &mut InMemoryVm, names: &[&str]| -> Vec<KlassHandle> {
        names
            .iter()
            .map(|n| vm.define_class(ClassSpec::new(*n, LoaderType::App)))
            .collect()
    };
    let (main, shape) = if reversed {
        let k = define(&mut vm, &["app/Shape", "app/Main"]);
        (k[1], k[0])
    } else {
        let k = define(&mut vm, &["app/Main", "app/Shape"]);
        (k[0], k[1])
    };
    let circle = vm.define_class(ClassSpec::new("app/Circle", LoaderType::App).extends(shape));
    let square = vm.define_class(ClassSpec::new("app/Square", LoaderType::App).extends(shape));
    let (run, area) = if reversed {
        let area = vm.define_method(shape, "area", "()D");
        (vm.define_method(main, "run", "()V"), area)
    } else {
        let run = vm.define_method(main, "run", "()V");
        (run, vm.define_method(shape, "area", "()D"))
    };
    App {
        vm,
        main,
        shape,
        circle,
        square,
        run,
        area,
    }
}

pub fn app() -> App {
    app_with(0, false)
}

/// Method without relocations or records
pub fn plain(app: &App, method: MethodHandle) -> CompiledMethod {
    let mut asm = CodeAssembler::new(&app.vm, method);
    asm.nops(32);
    asm.finish()
}

/// `run` compiled with one speculation about the receiver at bci 7
pub fn speculating(app: &App, receiver: KlassHandle) -> CompiledMethod {
    let mut asm = CodeAssembler::new(&app.vm, app.run);
    asm.nops(16);
    let method = asm.meta_index(MetaRef::Method(app.run));
    let klass = asm.meta_index(MetaRef::Klass(receiver));
    asm.opt(OptRecord::ProfiledReceiver { method, bci: 7, klass });
    asm.finish()
}

/// `run` with every kind of patch site the codec handles
pub fn rich(app: &App) -> CompiledMethod {
    let mut asm = CodeAssembler::new(&app.vm, app.run);
    asm.nops(8).set_entries(0, 8);
    asm.oop(ObjectRef::Str("greeting".into()), false)
        .oop(ObjectRef::Mirror(app.circle), true)
        .oop(ObjectRef::Known(KnownObject::TheNullString), false)
        .metadata(MetaRef::Klass(app.shape), false)
        .metadata(MetaRef::Method(app.area), true)
        .metadata(MetaRef::Method(app.run), false);
    asm.runtime_call(VmGlobalKind::UncommonTrapBlob)
        .unwrap()
        .external_word(VmGlobalKind::PollingPage, 0)
        .unwrap()
        .poll(true)
        .unwrap()
        .poll_return(false)
        .unwrap()
        .virtual_call()
        .unwrap()
        .opt_virtual_call()
        .unwrap()
        .static_call()
        .unwrap();
    asm.static_stub().internal_word(8).section_word(16).oop_map(2, &[1, 2, 3]);
    asm.dependency(DepType::LeafType, &[MetaRef::Klass(app.circle)]);
    asm.finish()
}

pub fn save(app: &App, path: &Path, methods: &[CompiledMethod]) -> SaveReport {
    let config = Config::for_save(path);
    CodeRevive::new(&config, &app.vm).save(methods).unwrap()
}

/// Cache for `app` loaded from the file named by `config`
pub fn restore<'a>(config: &'a Config, app: &'a App) -> CodeRevive<'a> {
    let mut cache = CodeRevive::new(config, &app.vm);
    cache.load().unwrap();
    cache
}
