use crate::engine::models::Language;

/// Per-language build and run recipe. Commands are relative to the
/// workspace root and are used by every local backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageSpec {
    pub source_name: &'static str,
    pub compile: Option<&'static [&'static str]>,
    pub run: &'static [&'static str],
    pub docker_image: &'static str,
    pub piston_language: &'static str,
    pub piston_version: &'static str,
}

impl LanguageSpec {
    pub fn for_language(language: &Language) -> Self {
        match language {
            Language::C => Self {
                source_name: "main.c",
                compile: Some(&["gcc", "-O2", "-std=c11", "-o", "main", "main.c", "-lm"]),
                run: &["./main"],
                docker_image: "gcc:14",
                piston_language: "c",
                piston_version: "10.2.0",
            },
            Language::Cpp => Self {
                source_name: "main.cpp",
                compile: Some(&["g++", "-O2", "-std=c++17", "-o", "main", "main.cpp"]),
                run: &["./main"],
                docker_image: "gcc:14",
                piston_language: "cpp",
                piston_version: "10.2.0",
            },
            Language::Python => Self {
                source_name: "main.py",
                compile: None,
                run: &["python3", "-I", "main.py"],
                docker_image: "python:3.12-alpine",
                piston_language: "python",
                piston_version: "3.10.0",
            },
            Language::JavaScript => Self {
                source_name: "main.js",
                compile: None,
                run: &["node", "main.js"],
                docker_image: "node:22-alpine",
                piston_language: "javascript",
                piston_version: "18.15.0",
            },
            Language::Java => Self {
                source_name: "Main.java",
                compile: Some(&["javac", "-encoding", "UTF-8", "Main.java"]),
                run: &["java", "-Xss64m", "-cp", ".", "Main"],
                docker_image: "eclipse-temurin:21",
                piston_language: "java",
                piston_version: "15.0.2",
            },
            Language::Go => Self {
                source_name: "main.go",
                compile: Some(&["go", "build", "-o", "main", "main.go"]),
                run: &["./main"],
                docker_image: "golang:1.22-alpine",
                piston_language: "go",
                piston_version: "1.16.2",
            },
            Language::Rust => Self {
                source_name: "main.rs",
                compile: Some(&["rustc", "-O", "-o", "main", "main.rs"]),
                run: &["./main"],
                docker_image: "rust:1.76-alpine",
                piston_language: "rust",
                piston_version: "1.68.2",
            },
        }
    }

    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Argument vector owned as strings, for builders that take `String`s.
    pub fn run_argv(&self) -> Vec<String> {
        self.run.iter().map(|s| s.to_string()).collect()
    }

    pub fn compile_argv(&self) -> Option<Vec<String>> {
        self.compile
            .map(|argv| argv.iter().map(|s| s.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpreted_languages_have_no_compile_step() {
        assert!(!LanguageSpec::for_language(&Language::Python).is_compiled());
        assert!(!LanguageSpec::for_language(&Language::JavaScript).is_compiled());
        assert!(LanguageSpec::for_language(&Language::Rust).is_compiled());
    }

    #[test]
    fn compile_commands_reference_the_source_file() {
        for language in [Language::C, Language::Cpp, Language::Java, Language::Go, Language::Rust] {
            let spec = LanguageSpec::for_language(&language);
            let argv = spec.compile_argv().unwrap();
            assert!(argv.iter().any(|arg| arg == spec.source_name), "{language}");
        }
    }
}
