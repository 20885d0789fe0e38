//! The registry's column dictionary
//!
//! Every archive published by the registry belongs to exactly one logical
//! table, identified by an infix in the archive file name (`EMPRE` for
//! companies, `ESTABELE` for establishments, and so on). The raw CSV parts
//! carry no header row; column names and types come from the data
//! dictionary captured here as static per-table schemas.
//!
//! The dictionary is the validating transform applied at ingest: schemas
//! are never inferred from the data.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

/// Precision/scale for monetary columns (`capital_social`). The registry
/// publishes values like `000000001000,00`; two fractional digits, comma
/// separator.
pub const MONEY_PRECISION: u8 = 15;
pub const MONEY_SCALE: i8 = 2;

/// Semantic type of a dictionary column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Free text or coded text, latin-1 in the source
    Text,
    /// Compact numeric date, `YYYYMMDD`; `0` and `00000000` are null
    Date,
    /// Fixed-precision decimal with a comma decimal separator
    Decimal,
    /// Single-character `S`/`N` flag
    Flag,
}

/// One column of a logical table's fixed schema
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

const fn key(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        ty: ColumnType::Text,
        nullable: false,
    }
}

const fn text(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        ty: ColumnType::Text,
        nullable: true,
    }
}

const fn date(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        ty: ColumnType::Date,
        nullable: true,
    }
}

const fn money(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        ty: ColumnType::Decimal,
        nullable: true,
    }
}

const fn flag(name: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        ty: ColumnType::Flag,
        nullable: true,
    }
}

const EMPRESAS: &[ColumnSpec] = &[
    key("cnpj_basico"),
    text("razao_social"),
    text("natureza_juridica"),
    text("qualificacao_responsavel"),
    money("capital_social"),
    text("porte_empresa"),
    text("ente_federativo_responsavel"),
];

const ESTABELECIMENTOS: &[ColumnSpec] = &[
    key("cnpj_basico"),
    key("cnpj_ordem"),
    key("cnpj_dv"),
    text("identificador_matriz_filial"),
    text("nome_fantasia"),
    text("situacao_cadastral"),
    date("data_situacao_cadastral"),
    text("motivo_situacao_cadastral"),
    text("nome_cidade_exterior"),
    text("pais"),
    date("data_inicio_atividade"),
    text("cnae_fiscal_principal"),
    text("cnae_fiscal_secundaria"),
    text("tipo_logradouro"),
    text("logradouro"),
    text("numero"),
    text("complemento"),
    text("bairro"),
    text("cep"),
    text("uf"),
    text("municipio"),
    text("ddd_1"),
    text("telefone_1"),
    text("ddd_2"),
    text("telefone_2"),
    text("ddd_fax"),
    text("fax"),
    text("correio_eletronico"),
    text("situacao_especial"),
    date("data_situacao_especial"),
];

const SOCIOS: &[ColumnSpec] = &[
    key("cnpj_basico"),
    text("identificador_socio"),
    text("nome_socio"),
    key("cnpj_cpf_socio"),
    text("qualificacao_socio"),
    date("data_entrada_sociedade"),
    text("pais"),
    text("representante_legal"),
    text("nome_representante"),
    text("qualificacao_representante_legal"),
    text("faixa_etaria"),
];

const SIMPLES: &[ColumnSpec] = &[
    key("cnpj_basico"),
    flag("opcao_simples"),
    date("data_opcao_simples"),
    date("data_exclusao_simples"),
    flag("opcao_mei"),
    date("data_opcao_mei"),
    date("data_exclusao_mei"),
];

/// Shared shape of the registry's reference/code tables
const CODE_TABLE: &[ColumnSpec] = &[key("codigo"), text("descricao")];

/// A logical table in the registry's data dictionary
///
/// One logical table may be backed by many archives (e.g. per-state
/// establishment shards); every archive maps to exactly one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableKind {
    Companies,
    Establishments,
    Partners,
    SimpleNational,
    Countries,
    Municipalities,
    PartnerQualifications,
    LegalNatures,
    EconomicActivities,
    RegistrationReasons,
}

impl TableKind {
    /// All logical tables, in publication order
    pub const ALL: &'static [TableKind] = &[
        TableKind::Companies,
        TableKind::Establishments,
        TableKind::Partners,
        TableKind::SimpleNational,
        TableKind::Countries,
        TableKind::Municipalities,
        TableKind::PartnerQualifications,
        TableKind::LegalNatures,
        TableKind::EconomicActivities,
        TableKind::RegistrationReasons,
    ];

    /// The canonical dataset name, as the registry (and the downstream
    /// dashboard) knows it. Also the table-store artifact stem.
    pub fn name(self) -> &'static str {
        match self {
            TableKind::Companies => "empresas",
            TableKind::Establishments => "estabelecimentos",
            TableKind::Partners => "socios",
            TableKind::SimpleNational => "simples",
            TableKind::Countries => "paises",
            TableKind::Municipalities => "municipios",
            TableKind::PartnerQualifications => "qualificacoes",
            TableKind::LegalNatures => "naturezas",
            TableKind::EconomicActivities => "cnaes",
            TableKind::RegistrationReasons => "motivos",
        }
    }

    /// The table's fixed, ordered column dictionary
    pub fn columns(self) -> &'static [ColumnSpec] {
        match self {
            TableKind::Companies => EMPRESAS,
            TableKind::Establishments => ESTABELECIMENTOS,
            TableKind::Partners => SOCIOS,
            TableKind::SimpleNational => SIMPLES,
            TableKind::Countries
            | TableKind::Municipalities
            | TableKind::PartnerQualifications
            | TableKind::LegalNatures
            | TableKind::EconomicActivities
            | TableKind::RegistrationReasons => CODE_TABLE,
        }
    }

    /// Indices of the columns forming a row's identity, used to remove
    /// duplicate rows across shards of the same table.
    pub fn key_columns(self) -> &'static [usize] {
        match self {
            TableKind::Companies | TableKind::SimpleNational => &[0],
            // cnpj_basico + cnpj_ordem + cnpj_dv
            TableKind::Establishments => &[0, 1, 2],
            // cnpj_basico + cnpj_cpf_socio
            TableKind::Partners => &[0, 3],
            // codigo
            TableKind::Countries
            | TableKind::Municipalities
            | TableKind::PartnerQualifications
            | TableKind::LegalNatures
            | TableKind::EconomicActivities
            | TableKind::RegistrationReasons => &[0],
        }
    }

    /// Classify an archive or extracted-part file name by its table infix.
    ///
    /// Returns `None` for auxiliary files (layout PDFs, signature files)
    /// that match no known pattern; the caller skips and logs those.
    pub fn from_file_name(file_name: &str) -> Option<TableKind> {
        let lower = file_name.to_lowercase();

        if lower.contains("empre") {
            Some(TableKind::Companies)
        } else if lower.contains("estabe") || lower.contains("estable") {
            Some(TableKind::Establishments)
        } else if lower.contains("socio") {
            Some(TableKind::Partners)
        } else if lower.contains("simples") {
            Some(TableKind::SimpleNational)
        } else if lower.contains("pais") {
            Some(TableKind::Countries)
        } else if lower.contains("munic") {
            Some(TableKind::Municipalities)
        } else if lower.contains("quals") || lower.contains("qualific") {
            Some(TableKind::PartnerQualifications)
        } else if lower.contains("natju") || lower.contains("natureza") {
            Some(TableKind::LegalNatures)
        } else if lower.contains("cnae") {
            Some(TableKind::EconomicActivities)
        } else if lower.contains("moti") {
            Some(TableKind::RegistrationReasons)
        } else {
            None
        }
    }

    /// The arrow schema this table's columnar artifact is written with.
    ///
    /// Column order, names, and types are stable across runs; this is the
    /// contract the table store exposes to downstream readers.
    pub fn arrow_schema(self) -> SchemaRef {
        let fields: Vec<Field> = self
            .columns()
            .iter()
            .map(|col| {
                let data_type = match col.ty {
                    ColumnType::Text => DataType::Utf8,
                    ColumnType::Date => DataType::Date32,
                    ColumnType::Decimal => {
                        DataType::Decimal128(MONEY_PRECISION, MONEY_SCALE)
                    }
                    ColumnType::Flag => DataType::Boolean,
                };
                Field::new(col.name, data_type, col.nullable)
            })
            .collect();
        Arc::new(Schema::new(fields))
    }
}

impl std::fmt::Display for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
