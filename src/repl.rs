// File: src/repl.rs
//
// Interactive REPL for Lume. Keeps one VM alive across inputs so
// globals, classes, and interned strings persist; multi-line input
// continues while delimiters are unbalanced.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::vm::Vm;

pub struct Repl {
    vm: Vm,
    editor: DefaultEditor,
}

impl Repl {
    pub fn new() -> Result<Repl, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: Vm::new(), editor })
    }

    fn show_banner(&self) {
        println!(
            "{} {}",
            "Lume".bright_cyan().bold(),
            format!("v{} — interactive shell", env!("CARGO_PKG_VERSION")).bright_blue()
        );
        println!("  {} for commands, {} to leave", ":help".bright_yellow(), ":quit".bright_yellow());
        println!();
    }

    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "lume> ".bright_green().to_string()
            } else {
                "....> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim_start().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        }
                        break;
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if input_complete(&buffer) {
                        self.eval(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (:quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    fn eval(&mut self, source: &str) {
        if let Err(error) = self.vm.interpret(source) {
            eprint!("{}", error);
        }
    }

    /// Returns true to continue the loop, false on :quit.
    fn handle_command(&mut self, command: &str) -> bool {
        match command {
            ":help" | ":h" => {
                println!("  {}   show this help", ":help".bright_yellow());
                println!("  {}   list defined globals", ":vars".bright_yellow());
                println!("  {}   leave the shell", ":quit".bright_yellow());
                true
            }
            ":vars" | ":v" => {
                for name in self.vm.global_names() {
                    println!("  {}", name);
                }
                true
            }
            ":quit" | ":q" | ":exit" => false,
            other => {
                println!("Unknown command {}. Try :help.", other.bright_yellow());
                true
            }
        }
    }
}

/// A buffer is ready to evaluate once its parens, brackets, braces,
/// and string quotes are balanced.
fn input_complete(source: &str) -> bool {
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            '/' if chars.peek() == Some(&'/') => {
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next == '\n' {
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    depth <= 0 && !in_string
}

#[cfg(test)]
mod tests {
    use super::input_complete;

    #[test]
    fn balanced_input_is_complete() {
        assert!(input_complete("dump 1;\n"));
        assert!(input_complete("fun f() { return 1; }\n"));
    }

    #[test]
    fn open_delimiters_continue_the_input() {
        assert!(!input_complete("fun f() {\n"));
        assert!(!input_complete("let t = { a: 1,\n"));
        assert!(!input_complete("dump \"unterminated\n"));
    }

    #[test]
    fn braces_inside_strings_and_comments_are_ignored() {
        assert!(input_complete("dump \"{\";\n"));
        assert!(input_complete("dump 1; // {\n"));
    }
}
