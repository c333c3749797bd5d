use std::fs;
use std::path::Path;

use crate::error::AgentError;

/// Reads the agent-id base from `path`. If the file doesn't exist yet, it
/// is created holding a fresh random 31-bit value. If it exists but its
/// contents aren't a plain decimal integer, startup fails.
pub fn load_or_create(path: &Path) -> Result<i64, AgentError> {
	match fs::read_to_string(path) {
		Ok(contents) => contents
			.trim()
			.parse::<i64>()
			.map_err(|_| AgentError::InvalidAgentIdFile(path.display().to_string())),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			let id = (rand::random::<u32>() & 0x7fff_ffff) as i64;
			fs::write(path, id.to_string())?;
			Ok(id)
		},
		Err(e) => Err(AgentError::Io(e)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn creates_file_when_absent() {
		let dir = std::env::temp_dir().join(format!("tunnelhub-idfile-test-{}", rand::random::<u32>()));
		let path = dir.join("agent.id");
		fs::create_dir_all(&dir).unwrap();

		let id = load_or_create(&path).unwrap();
		assert!(id >= 0);
		let again = load_or_create(&path).unwrap();
		assert_eq!(id, again);

		fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn rejects_non_numeric_contents() {
		let dir = std::env::temp_dir().join(format!("tunnelhub-idfile-test-{}", rand::random::<u32>()));
		let path = dir.join("agent.id");
		fs::create_dir_all(&dir).unwrap();
		fs::write(&path, "not-a-number").unwrap();

		assert!(load_or_create(&path).is_err());

		fs::remove_dir_all(&dir).unwrap();
	}
}
