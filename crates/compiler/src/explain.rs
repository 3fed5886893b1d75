use basalt_nquery::{DataSource, DimFilter, NativeQuery};

/// Render a native query as human-readable multiline text.
pub fn explain_native(query: &NativeQuery) -> String {
    let mut s = String::new();
    fmt_query(query, 0, &mut s);
    s
}

fn fmt_query(query: &NativeQuery, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match query {
        NativeQuery::Scan(q) => {
            out.push_str(&format!(
                "{pad}Scan columns={:?} limit={:?} offset={:?}\n",
                q.columns, q.limit, q.offset
            ));
            fmt_filter(q.filter.as_ref(), indent + 1, out);
            fmt_datasource(&q.data_source, indent + 1, out);
        }
        NativeQuery::Timeseries(q) => {
            out.push_str(&format!(
                "{pad}Timeseries granularity={:?} aggs={}\n",
                q.granularity,
                q.aggregations.len()
            ));
            fmt_filter(q.filter.as_ref(), indent + 1, out);
            fmt_datasource(&q.data_source, indent + 1, out);
        }
        NativeQuery::GroupBy(q) => {
            out.push_str(&format!(
                "{pad}GroupBy dims={} aggs={} having={}\n",
                q.dimensions.len(),
                q.aggregations.len(),
                q.having.is_some()
            ));
            fmt_filter(q.filter.as_ref(), indent + 1, out);
            fmt_datasource(&q.data_source, indent + 1, out);
        }
        NativeQuery::TopN(q) => {
            out.push_str(&format!(
                "{pad}TopN dimension={} threshold={}\n",
                q.dimension.output_name(),
                q.threshold
            ));
            fmt_filter(q.filter.as_ref(), indent + 1, out);
            fmt_datasource(&q.data_source, indent + 1, out);
        }
    }
}

fn fmt_filter(filter: Option<&DimFilter>, indent: usize, out: &mut String) {
    if let Some(f) = filter {
        let pad = "  ".repeat(indent);
        out.push_str(&format!("{pad}filter: {}\n", fmt_dim_filter(f)));
    }
}

fn fmt_dim_filter(f: &DimFilter) -> String {
    match f {
        DimFilter::True => "TRUE".to_string(),
        DimFilter::False => "FALSE".to_string(),
        DimFilter::Equality {
            column,
            match_value,
            ..
        } => format!("{column} = {match_value:?}"),
        DimFilter::Range {
            column,
            lower,
            upper,
            ..
        } => format!("{column} in range [{lower:?}, {upper:?}]"),
        DimFilter::In { column, values, .. } => format!("{column} IN ({} values)", values.len()),
        DimFilter::And { fields } => format!(
            "({})",
            fields
                .iter()
                .map(fmt_dim_filter)
                .collect::<Vec<_>>()
                .join(" AND ")
        ),
        DimFilter::Or { fields } => format!(
            "({})",
            fields
                .iter()
                .map(fmt_dim_filter)
                .collect::<Vec<_>>()
                .join(" OR ")
        ),
        DimFilter::Not { field } => format!("NOT ({})", fmt_dim_filter(field)),
        DimFilter::Like { column, pattern } => format!("{column} LIKE {pattern:?}"),
        DimFilter::ArrayContainsElement {
            column,
            element_match_value,
            ..
        } => format!("{column} CONTAINS {element_match_value:?}"),
        DimFilter::Null { column } => format!("{column} IS NULL"),
        DimFilter::Expression { expression } => format!("expr[{expression}]"),
    }
}

fn fmt_datasource(ds: &DataSource, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    match ds {
        DataSource::Table { name } => out.push_str(&format!("{pad}Table {name}\n")),
        DataSource::Lookup { lookup } => out.push_str(&format!("{pad}Lookup {lookup}\n")),
        DataSource::Inline { rows, .. } => {
            out.push_str(&format!("{pad}Inline rows={}\n", rows.len()))
        }
        DataSource::Join {
            left,
            right,
            right_prefix,
            condition,
            join_type,
            ..
        } => {
            out.push_str(&format!(
                "{pad}Join type={join_type:?} prefix={right_prefix} on={condition}\n"
            ));
            fmt_datasource(left, indent + 1, out);
            fmt_datasource(right, indent + 1, out);
        }
        DataSource::Union { data_sources } => {
            out.push_str(&format!("{pad}Union inputs={}\n", data_sources.len()));
            for d in data_sources {
                fmt_datasource(d, indent + 1, out);
            }
        }
        DataSource::Unnest {
            base,
            virtual_column,
            unnest_filter,
        } => {
            out.push_str(&format!(
                "{pad}Unnest {} := {}\n",
                virtual_column.name, virtual_column.expression
            ));
            if let Some(f) = unnest_filter {
                out.push_str(&format!("{pad}  unnest_filter: {}\n", fmt_dim_filter(f)));
            }
            fmt_datasource(base, indent + 1, out);
        }
        DataSource::Filtered { base, filter } => {
            out.push_str(&format!("{pad}Filtered {}\n", fmt_dim_filter(filter)));
            fmt_datasource(base, indent + 1, out);
        }
        DataSource::Query { query } => {
            out.push_str(&format!("{pad}Query:\n"));
            fmt_query(query, indent + 1, out);
        }
        DataSource::Restricted { base, .. } => {
            out.push_str(&format!("{pad}Restricted\n"));
            fmt_datasource(base, indent + 1, out);
        }
    }
}
