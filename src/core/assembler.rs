// This module writes finished snippet kernels as relocatable ELF objects using the object crate.
// The x64 target assembles a kernel into one flat byte buffer with its constant tables placed
// after the code, so the object needs a single .text section and one global function symbol
// at the kernel entry. External brgemm microkernels are called through absolute addresses baked
// into the code, so no relocations are produced. Objects are used for ahead-of-time caching of
// compiled snippets and for inspecting generated code with standard binutils.

//! ELF object output for compiled snippets.

use crate::core::error::{CompileError, CompileResult};
use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

/// Minimal ELF writer holding one text section.
pub struct ElfAssembler {
    text: Vec<u8>,
    symbols: Vec<(String, u64, u64)>,
}

impl ElfAssembler {
    pub fn new() -> Self {
        Self { text: Vec::new(), symbols: Vec::new() }
    }

    /// Append raw bytes to the text section and return their offset.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.text.len() as u64;
        self.text.extend_from_slice(bytes);
        offset
    }

    /// Define a global function symbol over `[offset, offset + size)` of the text section.
    pub fn define_function(&mut self, name: &str, offset: u64, size: u64) -> CompileResult<()> {
        if offset + size > self.text.len() as u64 {
            return Err(CompileError::structural(format!(
                "symbol {name} spans past the end of .text ({} bytes)",
                self.text.len()
            )));
        }
        self.symbols.push((name.to_string(), offset, size));
        Ok(())
    }

    pub fn text_size(&self) -> usize {
        self.text.len()
    }

    /// Write a relocatable x86-64 ELF object.
    pub fn build_object(&self) -> CompileResult<Vec<u8>> {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);
        obj.append_section_data(text, &self.text, 32);

        for (name, offset, size) in &self.symbols {
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value: *offset,
                size: *size,
                kind: SymbolKind::Text,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(text),
                flags: SymbolFlags::None,
            });
        }

        obj.write()
            .map_err(|e| CompileError::target(format!("failed to write ELF object: {e}")))
    }
}

impl Default for ElfAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Object as _, ObjectSection, ObjectSymbol};

    #[test]
    fn test_simple_object() {
        let mut asm = ElfAssembler::new();
        let off = asm.append(&[0xC3]);
        asm.define_function("snippet", off, 1).unwrap();

        let bytes = asm.build_object().unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.data().unwrap(), &[0xC3]);
        let sym = file.symbol_by_name("snippet").unwrap();
        assert_eq!(sym.address(), 0);
        assert_eq!(sym.size(), 1);
    }

    #[test]
    fn test_symbol_out_of_range() {
        let mut asm = ElfAssembler::new();
        asm.append(&[0x90, 0xC3]);
        let err = asm.define_function("bad", 1, 4).unwrap_err();
        assert!(matches!(err, CompileError::StructuralIr { .. }));
    }
}
