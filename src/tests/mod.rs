// Integration tests: full pipeline wiring across scanner, writer queue,
// engine sync, search, and the tool registry.
