//! Berth's own bookkeeping objects.
//!
//! Two tables record what has been applied - `public.berth_migrations`
//! (applied migration filenames) and `public.berth_objects` (per-object
//! content hashes) - and two routines support introspection:
//! `berth_obj_exists` answers existence checks and `berth_objsrc` returns
//! the live definition of an object as the tagged JSON shape
//! [`crate::DbSnapshot`] deserializes.
//!
//! Everything here is created or upgraded inside the administrative
//! transaction before any diffing begins, so a rolled-back run leaves no
//! trace of them on a fresh database either.

/// Applied migrations, keyed by unique filename.
pub const CREATE_MIGRATIONS_TABLE: &str = "\
create table if not exists public.berth_migrations (
    filename text not null,
    constraint uk4berth_migrations unique (filename)
);";

/// Object content hashes, keyed by unique (type, schema, name).
pub const CREATE_OBJECTS_TABLE: &str = "\
create table if not exists public.berth_objects (
    obj_type text not null,
    obj_schema text not null,
    obj_name text not null,
    hash text not null,
    constraint uk4berth_objects unique (obj_type, obj_schema, obj_name)
);";

/// Upsert for one object hash.
pub const SAVE_OBJECT_HASH: &str = "\
insert into public.berth_objects (obj_type, obj_schema, obj_name, hash)
values ($1, $2, $3, $4)
on conflict (obj_type, obj_schema, obj_name)
do update set hash = $4;";

/// Record one applied migration.
pub const MARK_MIGRATION_APPLIED: &str =
    "insert into public.berth_migrations (filename) values ($1);";

/// Existence check routine, one query for every managed kind.
pub const CREATE_OBJ_EXISTS_FUNCTION: &str = r#"
create or replace function public.berth_obj_exists(p_kind text, p_schema text, p_name text)
returns boolean
language sql stable
as $berth$
    select case p_kind
        when 'schema' then exists (
            select null from pg_catalog.pg_namespace where nspname = p_name)
        when 'table' then exists (
            select null from information_schema.tables
             where table_schema = p_schema and table_name = p_name)
        when 'function' then exists (
            select null from information_schema.routines
             where routine_schema = p_schema and routine_name = p_name)
        when 'extension' then exists (
            select null from pg_catalog.pg_extension where extname = p_name)
        else false
    end;
$berth$;"#;

/// Live-definition fetch routine.
///
/// Returns a jsonb document tagged by kind, or null when the object does
/// not exist. Tables and sequences come back as structural specs with
/// members sorted by name (canonical order); the other kinds come back as
/// their definition text.
pub const CREATE_OBJSRC_FUNCTION: &str = r#"
create or replace function public.berth_objsrc(p_kind text, p_schema text, p_name text)
returns jsonb
language plpgsql stable
as $berth$
declare
    v_oid oid;
begin
    if p_kind = 'table' then
        select c.oid into v_oid
          from pg_catalog.pg_class c
          join pg_catalog.pg_namespace n on n.oid = c.relnamespace
         where n.nspname = p_schema and c.relname = p_name and c.relkind = 'r';
        if v_oid is null then
            return null;
        end if;
        return jsonb_build_object(
            'kind', 'table',
            'spec', jsonb_build_object(
                'schema', p_schema,
                'name', p_name,
                'comment', obj_description(v_oid, 'pg_class'),
                'cols', coalesce((
                    select jsonb_agg(jsonb_build_object(
                        'name', a.attname,
                        'datatype', pg_catalog.format_type(a.atttypid, a.atttypmod),
                        'required', a.attnotnull,
                        'default', pg_get_expr(d.adbin, d.adrelid),
                        'comment', col_description(v_oid, a.attnum),
                        'column_id', a.attnum
                    ) order by a.attname)
                      from pg_catalog.pg_attribute a
                      left join pg_catalog.pg_attrdef d
                        on d.adrelid = a.attrelid and d.adnum = a.attnum
                     where a.attrelid = v_oid and a.attnum > 0 and not a.attisdropped
                ), '[]'::jsonb),
                'cons', coalesce((
                    select jsonb_agg(jsonb_build_object(
                        'name', con.conname,
                        'type', con.contype::text,
                        'columns', coalesce((
                            select jsonb_agg(att.attname order by ord.n)
                              from unnest(con.conkey) with ordinality as ord(attnum, n)
                              join pg_catalog.pg_attribute att
                                on att.attrelid = v_oid and att.attnum = ord.attnum
                        ), '[]'::jsonb),
                        'definition', pg_get_constraintdef(con.oid)
                    ) order by con.conname)
                      from pg_catalog.pg_constraint con
                     where con.conrelid = v_oid and con.contype in ('p', 'u', 'f', 'c')
                ), '[]'::jsonb),
                'indx', coalesce((
                    select jsonb_agg(jsonb_build_object(
                        'name', ic.relname,
                        'columns', coalesce((
                            select jsonb_agg(att.attname order by ord.n)
                              from unnest(ix.indkey::int2[]) with ordinality as ord(attnum, n)
                              join pg_catalog.pg_attribute att
                                on att.attrelid = v_oid and att.attnum = ord.attnum
                             where ord.attnum > 0
                        ), '[]'::jsonb),
                        'unique', ix.indisunique,
                        'where', pg_get_expr(ix.indpred, ix.indrelid)
                    ) order by ic.relname)
                      from pg_catalog.pg_index ix
                      join pg_catalog.pg_class ic on ic.oid = ix.indexrelid
                     where ix.indrelid = v_oid
                       and not exists (
                           select null from pg_catalog.pg_constraint cc
                            where cc.conindid = ix.indexrelid)
                ), '[]'::jsonb)
            )
        );
    elsif p_kind = 'sequence' then
        if not exists (
            select null from pg_catalog.pg_sequences
             where schemaname = p_schema and sequencename = p_name) then
            return null;
        end if;
        return (
            select jsonb_build_object(
                'kind', 'sequence',
                'spec', jsonb_build_object(
                    'schema', p_schema,
                    'name', p_name,
                    'start', s.start_value,
                    'increment', s.increment_by,
                    'min_value', s.min_value,
                    'max_value', s.max_value,
                    'cache', s.cache_size,
                    'cycle', s.cycle
                ))
              from pg_catalog.pg_sequences s
             where s.schemaname = p_schema and s.sequencename = p_name);
    elsif p_kind = 'function' then
        select p.oid into v_oid
          from pg_catalog.pg_proc p
          join pg_catalog.pg_namespace n on n.oid = p.pronamespace
         where n.nspname = p_schema and p.proname = p_name
         limit 1;
        if v_oid is null then
            return null;
        end if;
        return jsonb_build_object(
            'kind', 'function',
            'src', pg_get_functiondef(v_oid),
            'identity_arguments', pg_get_function_identity_arguments(v_oid));
    elsif p_kind = 'view' then
        select c.oid into v_oid
          from pg_catalog.pg_class c
          join pg_catalog.pg_namespace n on n.oid = c.relnamespace
         where n.nspname = p_schema and c.relname = p_name and c.relkind = 'v';
        if v_oid is null then
            return null;
        end if;
        return jsonb_build_object(
            'kind', 'view',
            'src', 'create or replace view ' || p_schema || '.' || p_name
                   || ' as ' || pg_get_viewdef(v_oid, true));
    elsif p_kind = 'trigger' then
        select t.oid into v_oid
          from pg_catalog.pg_trigger t
          join pg_catalog.pg_class c on c.oid = t.tgrelid
          join pg_catalog.pg_namespace n on n.oid = c.relnamespace
         where n.nspname = p_schema and t.tgname = p_name and not t.tgisinternal
         limit 1;
        if v_oid is null then
            return null;
        end if;
        return jsonb_build_object(
            'kind', 'trigger',
            'src', pg_get_triggerdef(v_oid));
    end if;
    return null;
end;
$berth$;"#;

/// Views selecting from specific columns of a table (`$1` = qualified table
/// name, `$2` = column names). Used after a column datatype change.
pub const DEPENDENT_VIEWS_OF_COLUMNS: &str = r#"
select distinct
       v.relnamespace::regnamespace::text as schema,
       v.relname::text as name
  from pg_catalog.pg_depend as d
  join pg_catalog.pg_attribute as a
    on d.refobjsubid = a.attnum and d.refobjid = a.attrelid and a.attname = any($2)
  join pg_catalog.pg_rewrite as r on r.oid = d.objid
  join pg_catalog.pg_class as v on v.oid = r.ev_class
 where v.relkind = 'v'
   and d.classid = 'pg_rewrite'::regclass
   and d.deptype = 'n'
   and d.refclassid = 'pg_class'::regclass
   and d.refobjid = to_regclass($1);"#;

/// Views selecting from another view (`$1` = qualified view name).
pub const DEPENDENT_VIEWS_OF_VIEW: &str = r#"
select distinct
       v.relnamespace::regnamespace::text as schema,
       v.relname::text as name
  from pg_catalog.pg_depend as d
  join pg_catalog.pg_rewrite as r on r.oid = d.objid
  join pg_catalog.pg_class as v on v.oid = r.ev_class
 where v.relkind = 'v'
   and d.classid = 'pg_rewrite'::regclass
   and d.deptype = 'n'
   and d.refclassid = 'pg_class'::regclass
   and d.refobjid = to_regclass($1)
   and v.oid != d.refobjid;"#;

/// Views calling a function (`$1` = qualified function name).
pub const DEPENDENT_VIEWS_OF_FUNCTION: &str = r#"
select distinct
       v.relnamespace::regnamespace::text as schema,
       v.relname::text as name
  from pg_catalog.pg_depend as d
  join pg_catalog.pg_rewrite as r on r.oid = d.objid
  join pg_catalog.pg_class as v on v.oid = r.ev_class
 where v.relkind = 'v'
   and d.classid = 'pg_rewrite'::regclass
   and d.deptype = 'n'
   and d.refclassid = 'pg_proc'::regclass
   and d.refobjid = to_regproc($1);"#;

/// Triggers executing a function (`$1` = qualified function name).
pub const DEPENDENT_TRIGGERS_OF_FUNCTION: &str = r#"
select distinct
       c.relnamespace::regnamespace::text as schema,
       t.tgname::text as name
  from pg_catalog.pg_depend as d
  join pg_catalog.pg_trigger t on t.oid = d.objid
  join pg_catalog.pg_class c on c.oid = t.tgrelid
 where d.classid = 'pg_trigger'::regclass
   and d.deptype = 'n'
   and d.refclassid = 'pg_proc'::regclass
   and d.refobjid = to_regproc($1);"#;

/// Everything `ensure_support_objects` runs, in order. The routines come
/// first so nothing else can race ahead of them; order within one
/// transaction is what matters.
pub const SUPPORT_OBJECTS: &[&str] = &[
    CREATE_OBJ_EXISTS_FUNCTION,
    CREATE_OBJSRC_FUNCTION,
    CREATE_MIGRATIONS_TABLE,
    CREATE_OBJECTS_TABLE,
];
