use swc_core::{
    common::{
        input::StringInput, sync::Lrc, FileName, Globals, Mark, SourceMap, Span, Spanned, GLOBALS,
    },
    ecma::{
        ast::Program,
        codegen::{text_writer::JsWriter, Emitter},
        parser::{error::Error as ParserError, EsSyntax, Parser, Syntax},
        transforms::base::resolver,
    },
};

use crate::diagnostics::Location;
use crate::error::DeobError;

/// Runs `f` with a fresh swc `Globals` installed. Marks and hygiene state
/// never leak between scripts.
pub fn with_globals<R>(f: impl FnOnce() -> R) -> R {
    let globals = Globals::new();
    GLOBALS.set(&globals, f)
}

/// One parsed script plus the source map needed to report locations and
/// print it back out. Must be created and used inside [`with_globals`].
pub struct SourceTree {
    cm: Lrc<SourceMap>,
    pub program: Program,
}

impl SourceTree {
    pub fn parse(name: &str, source: &str) -> Result<Self, DeobError> {
        let cm: Lrc<SourceMap> = Default::default();
        let fm = cm.new_source_file(FileName::Custom(name.to_string()).into(), source.to_string());
        let mut parser = Parser::new(
            Syntax::Es(EsSyntax::default()),
            StringInput::from(&*fm),
            None,
        );
        let parsed = parser.parse_program();
        // Recovered errors still mean the input is malformed.
        let recovered = parser.take_errors();
        let mut program = parsed.map_err(|err| parse_error(&cm, err))?;
        if let Some(err) = recovered.into_iter().next() {
            return Err(parse_error(&cm, err));
        }

        program.mutate(resolver(Mark::new(), Mark::new(), false));

        Ok(Self { cm, program })
    }

    pub fn source_map(&self) -> &Lrc<SourceMap> {
        &self.cm
    }

    pub fn emit(&self) -> String {
        emit_program(&self.cm, &self.program)
    }

    pub fn location(&self, span: Span) -> Option<Location> {
        span_location(&self.cm, span)
    }
}

fn span_location(cm: &SourceMap, span: Span) -> Option<Location> {
    if span.is_dummy() {
        return None;
    }
    let loc = cm.lookup_char_pos(span.lo());
    Some(Location {
        line: loc.line,
        column: loc.col.0,
    })
}

fn parse_error(cm: &SourceMap, err: ParserError) -> DeobError {
    let location = span_location(cm, err.span()).unwrap_or(Location { line: 0, column: 0 });
    DeobError::Parse {
        location,
        message: err.kind().msg().to_string(),
    }
}

pub(crate) fn emit_program(cm: &Lrc<SourceMap>, program: &Program) -> String {
    let mut buf = Vec::new();
    {
        let mut emitter = Emitter {
            cfg: Default::default(),
            cm: cm.clone(),
            comments: None,
            wr: JsWriter::new(cm.clone(), "\n", &mut buf, None),
        };
        // Writing into a Vec cannot fail.
        let _ = emitter.emit_program(program);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
