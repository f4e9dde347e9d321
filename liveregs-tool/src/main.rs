use std::path::PathBuf;

use clap::Parser;
use liveregs::{
    code_info::CodeInfo,
    codegen::encoder::{RecordingEncoder, INST_SIZE},
    codegen::{Method, Opcode},
    serialize::SerializableMethod,
    sim::{Machine, Parked, Runtime, SimError},
    target::arch_info,
    Arch, CodeGenerator, CompilerOptions, LifeIntervals, LiveRegisters, RegMask, SpillFillResolver,
    VRegMask, ValueType,
};

#[derive(Parser)]
/// Tool for testing liveregs.
struct Args {
    /// Print the input method, the generated code and its stack maps.
    #[clap(short = 'v')]
    verbose: bool,

    /// Input file containing a bincode-encoded SerializableMethod.
    input: PathBuf,

    /// Run the method in the simulator with these arguments. Runtime
    /// calls return 0; every time the thread parks its stack is dumped.
    #[clap(long = "run", num_args = 0..)]
    run: Option<Vec<u64>>,

    /// Type to read the result of `--run` as.
    #[clap(long = "result", default_value = "int64")]
    result: CliType,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliType {
    Int32,
    Int64,
    Float32,
    Float64,
    Reference,
}

impl From<CliType> for ValueType {
    fn from(cli_ty: CliType) -> ValueType {
        match cli_ty {
            CliType::Int32 => ValueType::Int32,
            CliType::Int64 => ValueType::Int64,
            CliType::Float32 => ValueType::Float32,
            CliType::Float64 => ValueType::Float64,
            CliType::Reference => ValueType::Reference,
        }
    }
}

fn main() {
    pretty_env_logger::init();
    let args = Args::parse();

    let input = std::fs::read(&args.input).expect("could not read input file");
    let serialized: SerializableMethod =
        bincode::deserialize(&input).expect("could not deserialize input file");

    if args.verbose {
        println!("Input method: {serialized:?}");
    }

    let arch = serialized.arch();
    let method = serialized.method();
    let intervals = serialized.intervals();
    let options = serialized.options();

    if args.verbose {
        print_live_registers(arch, method, &intervals, options);
    }

    let mut enc = RecordingEncoder::new(arch);
    let compiled = match CodeGenerator::new(method, &intervals, arch, options)
        .and_then(|codegen| codegen.generate(&mut enc))
    {
        Ok(compiled) => compiled,
        Err(e) => {
            panic!("Code generation failed: {e:#?}");
        }
    };
    let code = enc.finish().expect("encoder failed");
    let info = match CodeInfo::decode(&compiled.code_info) {
        Ok(info) => info,
        Err(e) => {
            panic!("Code info does not decode: {e:#?}");
        }
    };

    if args.verbose {
        print!("Generated code: {{\n");
        print!(
            "  size {} frame_slots {} stack_maps {}\n",
            compiled.code_size, compiled.frame_slots, compiled.num_stack_maps
        );
        for (i, inst) in code.insts.iter().enumerate() {
            print!("  {:4}: {inst}\n", i as u32 * INST_SIZE);
        }
        print!("}}\n");
        print_stack_maps(&info);
    }

    if let Some(run_args) = args.run {
        let mut machine = Machine::new(arch, 0x10000, DumpRuntime::default());
        machine
            .install(method, &compiled, code)
            .expect("could not install the method");
        match machine.run(method.id, &run_args, args.result.into()) {
            Ok(result) => println!("Result: {result:#x}"),
            Err(e) => panic!("Simulation failed: {e:#?}"),
        }
    }
}

/// Dumps the stack every time the thread parks.
#[derive(Default)]
struct DumpRuntime {
    parks: usize,
}

impl DumpRuntime {
    fn dump(&mut self, what: &str, parked: &mut Parked<'_>) {
        let mut out = String::new();
        let mut walker = parked.walker();
        if !walker.verify() {
            println!("Stack at {what} #{} does not verify", self.parks);
        }
        if let Err(e) = walker.dump(&mut out) {
            panic!("Stack dump failed: {e:#?}");
        }
        print!("Stack at {what} #{}: {{\n{out}}}\n", self.parks);
        self.parks += 1;
    }
}

impl Runtime for DumpRuntime {
    fn call(&mut self, entrypoint: u32, args: &[u64], mut parked: Parked<'_>) -> Result<u64, SimError> {
        self.dump(&format!("runtime call {entrypoint} {args:?}"), &mut parked);
        Ok(0)
    }

    fn safepoint(&mut self, mut parked: Parked<'_>) -> Result<(), SimError> {
        self.dump("safepoint", &mut parked);
        Ok(())
    }
}

fn print_live_registers(
    arch: Arch,
    method: &Method,
    intervals: &LifeIntervals,
    options: &CompilerOptions,
) {
    let live = LiveRegisters::new(intervals, arch_info(arch), options);
    let mut resolver = SpillFillResolver::new(arch);
    let none = (RegMask::empty(), VRegMask::empty());
    print!("Live registers: {{\n");
    for inst in &method.insts {
        let (int, fp) = live.get_live_registers::<true>(Some(inst.id), none);
        print!("  inst{}: {int} / {fp}\n", inst.id.index());
        if let Opcode::SpillFill(group) = &inst.opcode {
            match resolver.resolve(group) {
                Ok(resolved) => {
                    let cycles = resolved.cycles;
                    let sequence = resolved.into_sequence();
                    print!("    spill_fill ({cycles} cycles):");
                    for m in sequence.moves() {
                        print!(" {m:?};");
                    }
                    print!("\n");
                }
                Err(e) => print!("    spill_fill failed: {e}\n"),
            }
        }
    }
    print!("}}\n");
}

fn print_stack_maps(info: &CodeInfo) {
    let (int, fp) = info.saved_callees();
    print!("Stack maps (callee saves {int} / {fp}): {{\n");
    for map in info.stack_maps() {
        print!(
            "  native_pc {} bytecode_pc {}:\n",
            map.native_pc, map.bytecode_pc
        );
        for (i, vreg) in info.vregs(map).iter().enumerate() {
            if vreg.live {
                print!("    v{i}: {:?} {} = {:#x}", vreg.kind, vreg.ty, vreg.value);
                if vreg.object {
                    print!(" (object)");
                }
                print!("\n");
            }
        }
    }
    print!("}}\n");
}
