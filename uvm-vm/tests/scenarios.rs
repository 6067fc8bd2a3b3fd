//! End-to-end scenarios driven through the full `Vm`: load an image, run
//! it, and check the resulting register/memory state.

use uvm_cpu::{FaultKind, Gpr, RegisterFile};
use uvm_elf::image::{ElfHeader, ProgramHeader, SectionHeader};
use uvm_elf::reloc::{R_386_RELATIVE, SymbolResolver};
use uvm_memory::{AddressSpace, GuestAddress};
use uvm_vm::{ControlFlow, RunOutcome, SyscallHandler, TrapKind, Vm, VmConfig};
use uvm_loader::LoaderConfig;

/// Minimal Linux/Haiku-style `INT 0x80` handler: `EAX==1` means exit with
/// the code in `EBX`; anything else is treated as unimplemented.
struct ExitOnSyscallOne;

impl SymbolResolver for ExitOnSyscallOne {
    fn resolve(&mut self, _name: &str) -> Option<GuestAddress> {
        None
    }
}

impl SyscallHandler for ExitOnSyscallOne {
    fn dispatch(&mut self, trap: TrapKind, regs: &mut RegisterFile, _mem: &mut AddressSpace) -> ControlFlow {
        match trap {
            TrapKind::Interrupt(0x80) if regs.get_r32(Gpr::Eax) == 1 => {
                ControlFlow::Exit(regs.get_r32(Gpr::Ebx) as i32)
            }
            _ => ControlFlow::Continue,
        }
    }
}

fn elf32_exec_image(entry_vaddr: u32, code: &[u8]) -> Vec<u8> {
    build_image(ElfHeader::ET_EXEC, entry_vaddr, code, &[])
}

fn build_image(e_type: u16, entry_vaddr: u32, code: &[u8], extra_data: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; 52];
    bytes[0..4].copy_from_slice(&ElfHeader::MAGIC);
    bytes[4] = ElfHeader::CLASS32;
    bytes[5] = ElfHeader::DATA_LSB;
    bytes[6] = ElfHeader::EV_CURRENT;
    bytes[16..18].copy_from_slice(&e_type.to_le_bytes());
    bytes[18..20].copy_from_slice(&ElfHeader::EM_386.to_le_bytes());
    bytes[20..24].copy_from_slice(&1u32.to_le_bytes());
    bytes[24..28].copy_from_slice(&entry_vaddr.to_le_bytes());
    bytes[28..32].copy_from_slice(&52u32.to_le_bytes()); // e_phoff
    bytes[42..44].copy_from_slice(&32u16.to_le_bytes()); // e_phentsize
    bytes[44..46].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

    let ph_off = bytes.len();
    bytes.resize(ph_off + 32, 0);
    let file_off = bytes.len();
    let mut payload = code.to_vec();
    payload.extend_from_slice(extra_data);
    bytes.extend_from_slice(&payload);

    bytes[ph_off..ph_off + 4].copy_from_slice(&ProgramHeader::PT_LOAD.to_le_bytes());
    bytes[ph_off + 4..ph_off + 8].copy_from_slice(&(file_off as u32).to_le_bytes());
    bytes[ph_off + 8..ph_off + 12].copy_from_slice(&0u32.to_le_bytes()); // p_vaddr (segment starts at 0)
    bytes[ph_off + 16..ph_off + 20].copy_from_slice(&(payload.len() as u32).to_le_bytes()); // p_filesz
    bytes[ph_off + 20..ph_off + 24].copy_from_slice(&(payload.len() as u32).to_le_bytes()); // p_memsz
    bytes[ph_off + 24..ph_off + 28]
        .copy_from_slice(&(ProgramHeader::PF_R | ProgramHeader::PF_W | ProgramHeader::PF_X).to_le_bytes());

    bytes
}

fn run_to_completion(vm: &mut Vm) -> RunOutcome {
    vm.run(Some(10_000))
}

#[test]
fn static_add_and_exit() {
    let code = [
        0xB8, 0x05, 0x00, 0x00, 0x00, // mov eax, 5
        0xBB, 0x07, 0x00, 0x00, 0x00, // mov ebx, 7
        0x01, 0xD8, // add eax, ebx
        0x89, 0xC3, // mov ebx, eax
        0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xCD, 0x80, // int 0x80
    ];
    let image = elf32_exec_image(0, &code);

    let mut vm = Vm::new(VmConfig::default(), Box::new(ExitOnSyscallOne)).unwrap();
    vm.load(&image, LoaderConfig::default()).unwrap();

    let outcome = run_to_completion(&mut vm);
    assert!(matches!(outcome, RunOutcome::Halted(12)));
    assert_eq!(vm.registers().get_r32(Gpr::Eax), 1);
    assert_eq!(vm.registers().get_r32(Gpr::Ebx), 12);
    assert_eq!(vm.instructions_executed(), 6);
}

#[test]
fn et_dyn_with_r386_relative_relocation() {
    // .data holds one 4-byte slot initialised to 0x00001234, with a single
    // R_386_RELATIVE relocation targeting it. No code needs to run for this
    // scenario — only the loader and relocator are under test.
    let data_off_in_segment = 0u32; // slot sits right at the start of the segment
    let slot_value = 0x0000_1234u32;
    let code = []; // entry is irrelevant; never executed
    let mut image = build_image(ElfHeader::ET_DYN, 0, &code, &slot_value.to_le_bytes());

    // Append a SHT_RELA section with one R_386_RELATIVE entry targeting
    // offset 0 of the loaded image, plus the section header table.
    let rela_off = image.len();
    image.extend_from_slice(&data_off_in_segment.to_le_bytes()); // r_offset
    image.extend_from_slice(&(R_386_RELATIVE).to_le_bytes()); // r_info (sym=0)
    image.extend_from_slice(&0i32.to_le_bytes()); // r_addend (unused; read from target word)

    let shoff = image.len();
    // section 0: SHT_NULL
    image.resize(shoff + 40, 0);
    // section 1: SHT_RELA covering the one entry above
    let sh1_off = image.len();
    image.resize(sh1_off + 40, 0);
    image[sh1_off + 4..sh1_off + 8].copy_from_slice(&SectionHeader::SHT_RELA.to_le_bytes());
    image[sh1_off + 16..sh1_off + 20].copy_from_slice(&(rela_off as u32).to_le_bytes()); // sh_offset
    image[sh1_off + 20..sh1_off + 24].copy_from_slice(&12u32.to_le_bytes()); // sh_size (one entry)

    image[28..32].copy_from_slice(&(shoff as u32).to_le_bytes()); // e_shoff
    image[46..48].copy_from_slice(&40u16.to_le_bytes()); // e_shentsize
    image[48..50].copy_from_slice(&2u16.to_le_bytes()); // e_shnum
    image[50..52].copy_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    let mut vm = Vm::new(VmConfig::default(), Box::new(ExitOnSyscallOne)).unwrap();
    let config = LoaderConfig { et_dyn_load_base: 0x0800_0000, ..Default::default() };
    let outcome = vm.load(&image, config).unwrap();

    assert_eq!(outcome.applied_count, 1);
    assert_eq!(outcome.failed_count, 0);
    let bytes = vm.read_memory(0x0800_0000, 4).unwrap();
    assert_eq!(u32::from_le_bytes(bytes.try_into().unwrap()), 0x0800_1234);
}

#[test]
fn stack_round_trip_through_the_vm() {
    let code = [
        0x68, 0xEF, 0xBE, 0xAD, 0xDE, // push 0xDEADBEEF
        0x58, // pop eax
        0xF4, // hlt
    ];
    let image = elf32_exec_image(0, &code);
    let mut vm = Vm::new(VmConfig::default(), Box::new(ExitOnSyscallOne)).unwrap();
    vm.load(&image, LoaderConfig::default()).unwrap();
    vm.registers_mut().set_r32(Gpr::Esp, 0xC000_0000);

    let outcome = run_to_completion(&mut vm);
    assert!(matches!(outcome, RunOutcome::Halted(_)));
    assert_eq!(vm.registers().get_r32(Gpr::Eax), 0xDEAD_BEEF);
    assert_eq!(vm.registers().get_r32(Gpr::Esp), 0xC000_0000);
}

#[test]
fn divide_by_zero_faults_through_the_vm() {
    let code = [0xF7, 0xF1]; // div ecx
    let image = elf32_exec_image(0, &code);
    let mut vm = Vm::new(VmConfig::default(), Box::new(ExitOnSyscallOne)).unwrap();
    vm.load(&image, LoaderConfig::default()).unwrap();
    vm.registers_mut().set_r32(Gpr::Eax, 100);
    vm.registers_mut().set_r32(Gpr::Edx, 0);
    vm.registers_mut().set_r32(Gpr::Ecx, 0);

    let outcome = run_to_completion(&mut vm);
    match outcome {
        RunOutcome::Faulted(FaultKind::DivideByZero { eip }, fault_eip) => {
            assert_eq!(eip, 0);
            assert_eq!(fault_eip, 0);
        }
        other => panic!("expected DivideByZero fault, got {other:?}"),
    }
    assert_eq!(vm.registers().get_r32(Gpr::Eax), 100);
}

#[test]
fn opcode_counters_tally_one_entry_per_mnemonic() {
    let code = [
        0xB8, 0x05, 0x00, 0x00, 0x00, // mov eax, 5
        0xBB, 0x07, 0x00, 0x00, 0x00, // mov ebx, 7
        0x01, 0xD8, // add eax, ebx
        0x89, 0xC3, // mov ebx, eax
        0xB8, 0x01, 0x00, 0x00, 0x00, // mov eax, 1
        0xCD, 0x80, // int 0x80
    ];
    let image = elf32_exec_image(0, &code);

    let config = VmConfig { enable_performance_counters: true, ..VmConfig::default() };
    let mut vm = Vm::new(config, Box::new(ExitOnSyscallOne)).unwrap();
    vm.load(&image, LoaderConfig::default()).unwrap();
    run_to_completion(&mut vm);

    let counters = vm.opcode_counters().expect("counters enabled");
    assert_eq!(counters.get("mov"), 4);
    assert_eq!(counters.get("add"), 1);
    assert_eq!(counters.get("int"), 1);
    assert_eq!(counters.total(), 6);
}
