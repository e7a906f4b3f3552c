//! File packaging builtins

use std::io::{Cursor, Write};
use std::sync::Arc;
use uuid::Uuid;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::runtime::def::{OperatorDef, ServiceDef, MAIN_SERVICE};
use crate::runtime::registry::{BuiltinCatalog, BuiltinConfig};
use crate::runtime::typedef::TypeDef;
use crate::runtime::value::Value;

/// Id of the `files.zip-pack` builtin
pub const ZIP_PACK_ID: Uuid = Uuid::from_u128(0x5a0e9d42_3bb1_4c77_8e19_90ff24c6a00e);

fn blueprint() -> OperatorDef {
    let mut def = OperatorDef::default();
    def.services.insert(
        MAIN_SERVICE.to_string(),
        ServiceDef::new(
            TypeDef::stream(TypeDef::map([
                ("path", TypeDef::string()),
                ("file", TypeDef::binary()),
            ])),
            TypeDef::binary(),
        ),
    );
    def
}

fn pack(entries: &[Value]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default();

    for entry in entries {
        let file = entry.as_map().expect("zip-pack expects {path, file} entries");
        let path = file["path"].as_str().expect("path must be a string");
        let bytes = file["file"].as_binary().expect("file must be binary");
        writer.start_file(path, options).expect("zip entry header");
        writer.write_all(bytes).expect("zip entry body");
    }

    writer.finish().expect("zip central directory").into_inner()
}

pub(crate) fn register(catalog: &BuiltinCatalog) {
    catalog.register(BuiltinConfig {
        id: ZIP_PACK_ID,
        name: "files.zip-pack",
        blueprint: blueprint(),
        body: Arc::new(|op| {
            let input = op.main().input().clone();
            let output = op.main().output().clone();
            while !op.check_stop() {
                // Assembles one full stream per archive.
                let value = input.pull();
                if value.is_stop() {
                    continue;
                }
                if value.is_marker() {
                    output.push(value);
                    continue;
                }
                let entries = value.as_stream().expect("zip-pack expects a stream");
                output.push(Value::Binary(pack(entries)));
            }
        }),
        connect_hook: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::def::InstanceDef;
    use crate::value_map;
    use std::io::Read;

    #[test]
    fn test_zip_pack_builds_readable_archive() {
        let instance = InstanceDef::new("pack", ZIP_PACK_ID.to_string());
        let op = BuiltinCatalog::global().make_operator(&instance).unwrap();
        op.main().output().bufferize();
        op.start().unwrap();

        let input = op.main().input();
        input.push_bos();
        input.stream().unwrap().push(value_map! {
            "path" => "a.txt",
            "file" => vec![0x61u8],
        });
        input.stream().unwrap().push(value_map! {
            "path" => "b.txt",
            "file" => vec![0x62u8],
        });
        input.push_eos();

        let archive_bytes = op.main().output().pull();
        op.stop();

        let bytes = archive_bytes.as_binary().unwrap().to_vec();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);

        let mut content = String::new();
        archive
            .by_name("a.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "a");

        content.clear();
        archive
            .by_name("b.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "b");
    }

    #[test]
    fn test_zip_pack_passes_foreign_markers() {
        use crate::runtime::value::{Marker, StreamId};

        let instance = InstanceDef::new("pack", ZIP_PACK_ID.to_string());
        let op = BuiltinCatalog::global().make_operator(&instance).unwrap();
        op.main().output().bufferize();
        op.start().unwrap();

        let foreign = Value::Marker(Marker::Bos(StreamId::new()));
        op.main().input().push(foreign.clone());
        assert_eq!(op.main().output().pull(), foreign);
        op.stop();
    }
}
