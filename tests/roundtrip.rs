//! Integration tests for writing modules to disk and loading them back.

mod common;

use common::{method, Install};
use dotpatch::{
    file::{DIRECTORY_CERTIFICATE, DIRECTORY_DEBUG},
    metadata::tables::TableId,
    prelude::*,
    writer::pe_checksum,
};

#[test]
fn unpatched_module_is_identical() {
    let install = Install::new();
    let module = install.load();
    assert!(!module.is_modified());

    let report = PatchPipeline::new()
        .run_and_write(&mut install.load(), &install.output())
        .unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(
        std::fs::read(install.output()).unwrap(),
        std::fs::read(install.game()).unwrap()
    );
    assert_eq!(ModuleWriter::new().to_vec(&module).unwrap(), module.file().data());
}

#[test]
fn patched_output_reloads() {
    let install = Install::new();
    let mut module = install.load();
    PatchPipeline::new()
        .add_patch(StorePurchasePatch::default())
        .add_patch(GameDebugLogPatch::default())
        .run_and_write(&mut module, &install.output())
        .unwrap();

    let written = ModuleLoader::new().load_file(&install.output()).unwrap();
    assert_eq!(written.name(), "Assembly-CSharp");
    assert_eq!(written.mvid(), module.mvid());
    assert_eq!(written.types().len(), module.types().len());
    assert_eq!(written.methods().len(), module.methods().len());

    for (token, body) in module.bodies() {
        assert!(
            written.original_body(*token).unwrap().ends_with(body.code()),
            "body of {token} was not written"
        );
    }

    // Untouched methods keep their RVA
    let unchanged = written
        .methods()
        .iter()
        .filter(|m| module.body(m.token).is_none())
        .all(|m| module.method(m.token).unwrap().rva == m.rva);
    assert!(unchanged);
}

#[test]
fn repatching_reuses_references() {
    let install = Install::new();
    let mut module = install.load();
    let pipeline = PatchPipeline::new().add_patch(GameDebugLogPatch::default());
    pipeline.run_and_write(&mut module, &install.output()).unwrap();
    let member_refs = module.metadata().tables.row_count(TableId::MemberRef);
    assert_eq!(member_refs, 2);

    let mut again = ModuleLoader::new().load_file(&install.output()).unwrap();
    pipeline.run(&mut again).unwrap();
    assert!(!again.metadata_changed());
    assert_eq!(again.metadata().tables.row_count(TableId::MemberRef), member_refs);

    let log = method(&again, "GameDebug", "Log");
    assert_eq!(
        again.body(log).unwrap().code(),
        module.body(log).unwrap().code()
    );
}

#[test]
fn full_section_table_grows_headers() {
    let mut builder = common::game_builder();
    builder.extra_sections(2).debug_directory();
    let install = Install::with_game(&builder);
    let mut module = install.load();
    let before = module.file().sections().len();

    PatchPipeline::new()
        .add_patch(GameDebugLogPatch::default())
        .run_and_write(&mut module, &install.output())
        .unwrap();

    let written = ModuleLoader::new().load_file(&install.output()).unwrap();
    let file = written.file();
    assert_eq!(file.sections().len(), before + 1);
    assert!(file.layout().size_of_headers > module.file().layout().size_of_headers);
    assert!(file.directory(DIRECTORY_DEBUG).is_some());

    let log = method(&written, "GameDebug", "Log");
    assert!(written
        .original_body(log)
        .unwrap()
        .ends_with(module.body(log).unwrap().code()));
}

#[test]
fn bound_imports_fail_without_output() {
    let mut builder = common::game_builder();
    builder.extra_sections(2).bound_import();
    let install = Install::with_game(&builder);
    let mut module = install.load();

    let result = PatchPipeline::new()
        .add_patch(GameDebugLogPatch::default())
        .run_and_write(&mut module, &install.output());
    assert!(matches!(result, Err(Error::WriteLayout(_))));
    assert!(!install.output().exists());
}

#[test]
fn signature_is_stripped_and_checksum_updated() {
    let mut builder = common::game_builder();
    builder.certificate(&[0x30; 24]).checksum();
    let install = Install::with_game(&builder);
    let mut module = install.load();
    assert!(module.file().directory(DIRECTORY_CERTIFICATE).is_some());

    PatchPipeline::new()
        .add_patch(StorePurchasePatch::default())
        .run_and_write(&mut module, &install.output())
        .unwrap();

    let data = std::fs::read(install.output()).unwrap();
    let written = ModuleLoader::new().load_file(&install.output()).unwrap();
    let layout = written.file().layout();
    assert!(written.file().directory(DIRECTORY_CERTIFICATE).is_none());
    assert_eq!(layout.check_sum, pe_checksum(&data, layout.check_sum_offset()));
}
