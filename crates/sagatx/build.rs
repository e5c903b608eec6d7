// This build script generates Rust types and the tonic client/server for the
// coordinator protocol.
// - protox: parses the proto files without requiring a system protoc
// - tonic-prost-build: generates messages and the TxEventService stubs

fn main() -> Result<(), anyhow::Error> {
	let proto_files = ["proto/txevent.proto"]
		.iter()
		.map(|name| std::env::current_dir().map(|dir| dir.join(name)))
		.collect::<Result<Vec<_>, _>>()?;

	let include_dirs = ["proto/"]
		.iter()
		.map(|i| std::env::current_dir().map(|dir| dir.join(i)))
		.collect::<Result<Vec<_>, _>>()?;

	let config = {
		let mut c = prost_build::Config::new();
		c.disable_comments(Some("."));
		c
	};

	let fds = protox::compile(&proto_files, &include_dirs)?;
	tonic_prost_build::configure()
		.build_client(true)
		.build_server(true)
		.compile_fds_with_config(fds, config)?;

	// Tell cargo to re-run when protos change
	for path in [proto_files, include_dirs].concat() {
		println!("cargo:rerun-if-changed={}", path.display());
	}

	Ok(())
}
